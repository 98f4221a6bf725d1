// SPDX-License-Identifier: GPL-3.0-only

//! Shared data model: mode names, cable state, and the control/worker state
//! owned respectively by the main thread and the worker thread.

use std::collections::BTreeMap;
use std::fmt;

/// Internal mode names that are always defined, regardless of what dynamic
/// modes are installed.
pub mod internal_mode {
    pub const UNDEFINED: &str = "undefined";
    pub const BUSY: &str = "busy";
    pub const ASK: &str = "ask";
    pub const CHARGING_ONLY: &str = "charging_only";
    pub const CHARGING_ONLY_FALLBACK: &str = "charging_only_fallback";
    pub const DEDICATED_CHARGER: &str = "dedicated_charger";
}

/// Dynamic mode names that the engine itself needs to refer to by literal
/// value, as opposed to ones only ever named by whatever is in the catalog.
pub mod dynamic_mode {
    /// The mode rescue sessions drop into before the device is unlocked
    /// (spec §4.G step 3), independent of whatever `--diag` loaded.
    pub const DEVELOPER_MODE: &str = "developer_mode";
}

/// A mode name is just an owned string identifier; dynamic modes are loaded
/// from disk and are not known at compile time.
pub type ModeName = String;

/// Sentinel for "no caller uid observed yet" (spec §3 `current_user`).
pub const UNKNOWN_UID: u32 = u32::MAX;

/// Returns true if `name` is one of the always-defined internal modes.
pub fn is_internal_mode(name: &str) -> bool {
    use internal_mode::*;
    matches!(
        name,
        UNDEFINED | BUSY | ASK | CHARGING_ONLY | CHARGING_ONLY_FALLBACK | DEDICATED_CHARGER
    )
}

/// Physical cable state, fused from udev power-supply/extcon/android inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CableState {
    Unknown,
    Disconnected,
    ChargerConnected,
    PcConnected,
}

impl fmt::Display for CableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Disconnected => "disconnected",
            Self::ChargerConnected => "charger_connected",
            Self::PcConnected => "pc_connected",
        };
        f.write_str(s)
    }
}

/// One dynamic mode descriptor, as loaded from a `*.ini` file under the mode
/// catalog directory. Field names mirror the recognized keys in spec §3.
#[derive(Debug, Clone, Default)]
pub struct ModeDescriptor {
    pub mode_name: ModeName,
    pub mode_module: Option<String>,
    pub sysfs_path: Option<String>,
    pub sysfs_value: Option<String>,
    pub sysfs_reset_value: Option<String>,
    /// Up to 4 extra (path, value) pairs applied in order.
    pub android_extra_sysfs: Vec<(String, String)>,
    pub id_product: Option<String>,
    pub id_vendor_override: Option<String>,
    pub network: bool,
    pub network_interface: Option<String>,
    pub mass_storage: bool,
    pub appsync: bool,
    pub nat: bool,
    pub dhcp_server: bool,
    pub connman_tethering: Option<String>,
}

impl ModeDescriptor {
    /// The "trigger mode" launcher name, used by the mode catalog loader to
    /// decide a file is well-formed (spec §4.E).
    pub fn has_launcher(&self) -> bool {
        self.mode_module.is_some() || self.appsync
    }
}

/// Control state owned by the main thread (spec §3 "Control state").
#[derive(Debug, Clone)]
pub struct ControlState {
    pub cable: CableState,
    pub selected: Option<ModeName>,
    pub internal: ModeName,
    pub external: ModeName,
    pub target: ModeName,
    /// uid that activated the currently-selected dynamic mode (spec §3).
    pub user: u32,
    /// uid observed on the RPC connection that last asked for something,
    /// via `SO_PEERCRED` (spec §3 "current user"). [`UNKNOWN_UID`] until the
    /// first connection reports one.
    pub current_user: u32,
    pub rescue: bool,
    pub rescue_in_use: bool,
    /// Mirrors the daemon's `--diag` flag (spec §4.G step 4).
    pub diag: bool,
    pub enabled: bool,
    pub pending_user_change: bool,
    /// Set once early boot-up bookkeeping (e.g. `init-done`) has settled
    /// (spec §4.G step 5).
    pub init_done: bool,
    /// Device-lock export permission; defaults to `true` on platforms with
    /// no lock-screen integration (spec §4.G step 12).
    pub can_export: bool,
    /// Set while the system is tearing down; dynamic modes are frozen in
    /// place rather than re-resolved (spec §4.G step 6).
    pub in_shutdown: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            cable: CableState::Unknown,
            selected: None,
            internal: internal_mode::UNDEFINED.to_owned(),
            external: internal_mode::UNDEFINED.to_owned(),
            target: internal_mode::UNDEFINED.to_owned(),
            user: 0,
            current_user: UNKNOWN_UID,
            rescue: false,
            rescue_in_use: false,
            diag: false,
            enabled: false,
            pending_user_change: false,
            init_done: false,
            can_export: true,
            in_shutdown: false,
        }
    }
}

/// Maps an internal/external mode name to the "hardware mode" the worker
/// actually programs the gadget as (spec §4.H step 3).
pub fn map_to_hardware(mode: &str) -> ModeName {
    use internal_mode::*;
    match mode {
        UNDEFINED | ASK | CHARGING_ONLY_FALLBACK | CHARGING_ONLY | DEDICATED_CHARGER => {
            CHARGING_ONLY.to_owned()
        }
        other => other.to_owned(),
    }
}

/// Maps an internal mode to what is broadcast to external RPC consumers
/// (spec §4.I "ModeRequest").
pub fn map_to_external(mode: &str) -> ModeName {
    if mode == internal_mode::CHARGING_ONLY_FALLBACK {
        internal_mode::CHARGING_ONLY.to_owned()
    } else {
        mode.to_owned()
    }
}

/// State owned exclusively by the worker thread; the main thread only ever
/// touches the shared `WorkerRequest` slot under the mutex (spec §3).
#[derive(Debug, Default)]
pub struct WorkerOwnedState {
    pub activated_hw_mode: ModeName,
    pub active_descriptor: Option<ModeDescriptor>,
    pub tracked_writes: BTreeMap<String, String>,
}

impl WorkerOwnedState {
    pub fn new() -> Self {
        Self {
            activated_hw_mode: internal_mode::UNDEFINED.to_owned(),
            active_descriptor: None,
            tracked_writes: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_mapping_collapses_charging_like_modes() {
        assert_eq!(map_to_hardware(internal_mode::UNDEFINED), "charging_only");
        assert_eq!(map_to_hardware(internal_mode::ASK), "charging_only");
        assert_eq!(
            map_to_hardware(internal_mode::CHARGING_ONLY_FALLBACK),
            "charging_only"
        );
        assert_eq!(
            map_to_hardware(internal_mode::DEDICATED_CHARGER),
            "charging_only"
        );
        assert_eq!(map_to_hardware("mtp_mode"), "mtp_mode");
    }

    #[test]
    fn external_mapping_hides_fallback() {
        assert_eq!(
            map_to_external(internal_mode::CHARGING_ONLY_FALLBACK),
            "charging_only"
        );
        assert_eq!(map_to_external("mtp_mode"), "mtp_mode");
    }

    #[test]
    fn internal_modes_are_recognized() {
        assert!(is_internal_mode("busy"));
        assert!(is_internal_mode("ask"));
        assert!(!is_internal_mode("mtp_mode"));
    }
}
