// SPDX-License-Identifier: GPL-3.0-only

//! The backend selector (spec §4.C): the three actuators (configfs,
//! android_usb, kernel-modules) are mutually exclusive. Exactly one is
//! chosen at startup and modeled as a tagged variant; "apply mode" is the
//! only polymorphic seam (spec §9 "Backend probing").

pub mod android_usb;
pub mod configfs;
pub mod modules;

use anyhow::Result;
use tracing::info;

use crate::state::{internal_mode, ModeDescriptor};

/// What the worker asks a backend to do, expressed independently of how any
/// one backend implements it.
pub enum ApplyRequest<'a> {
    /// Plain charging: mass storage function (or android_usb's `mass_storage`
    /// gadget), a configurable charger product id, UDC enabled.
    Charging,
    /// A dynamic mode: program whatever the descriptor says, then enable UDC.
    Dynamic(&'a ModeDescriptor),
    /// Disable UDC and clear functions.
    Undefined,
}

impl<'a> ApplyRequest<'a> {
    pub fn for_mode(hw_mode: &str, descriptor: Option<&'a ModeDescriptor>) -> Self {
        match (hw_mode, descriptor) {
            (internal_mode::CHARGING_ONLY, _) => Self::Charging,
            (internal_mode::UNDEFINED, _) => Self::Undefined,
            (_, Some(d)) => Self::Dynamic(d),
            _ => Self::Undefined,
        }
    }
}

/// The common interface all three backends implement (spec §4.C).
pub trait Backend: Send {
    fn apply(&self, request: &ApplyRequest) -> Result<()>;

    /// Currently configured function list, config name -> function name
    /// (used for `GetFunctions`-style introspection and drift detection).
    fn current_functions(&self) -> Result<std::collections::BTreeMap<String, String>>;

    fn name(&self) -> &'static str;
}

pub enum BackendKind {
    Configfs(configfs::ConfigfsBackend),
    AndroidUsb(android_usb::AndroidUsbBackend),
    Modules(modules::ModulesBackend),
}

impl BackendKind {
    /// Probe configfs first, then android_usb, then fall back to kernel
    /// modules. Never switches after this call (spec §4.C).
    pub fn probe(configfs_root: &str, android_usb_root: &str) -> Self {
        if configfs::ConfigfsBackend::is_usable(configfs_root) {
            info!("Selected configfs backend");
            Self::Configfs(configfs::ConfigfsBackend::new(configfs_root))
        } else if android_usb::AndroidUsbBackend::is_usable(android_usb_root) {
            info!("Selected android_usb backend");
            Self::AndroidUsb(android_usb::AndroidUsbBackend::new(android_usb_root))
        } else {
            info!("Falling back to kernel-module backend");
            Self::Modules(modules::ModulesBackend::new())
        }
    }

    pub fn as_backend(&self) -> &dyn Backend {
        match self {
            Self::Configfs(b) => b,
            Self::AndroidUsb(b) => b,
            Self::Modules(b) => b,
        }
    }
}

/// Maps a logical function name (as used in descriptors) to the kernel's
/// configfs function-directory name. Overridable via the settings store
/// (spec §4.A `set_function`).
pub fn default_function_map() -> std::collections::BTreeMap<&'static str, &'static str> {
    std::collections::BTreeMap::from([
        ("mass_storage", "mass_storage.usb0"),
        ("rndis", "rndis_bam.rndis"),
        ("mtp", "ffs.mtp"),
        ("ffs", "ffs.mtp"),
        ("diag", "diag.diag"),
        ("adb", "ffs.adb"),
    ])
}
