// SPDX-License-Identifier: GPL-3.0-only

//! The kernel-module actuator (spec §4.B), used when neither configfs nor
//! android_usb is present. Loads/unloads the gadget driver module named by
//! each mode descriptor's `mode_module`, retrying across a "really
//! disconnect" broadcast when the previous module won't unload cleanly
//! (spec §4.B "Switching modules").

use std::{
    collections::BTreeMap,
    process::Command,
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::backend::{ApplyRequest, Backend};
use crate::state::ModeDescriptor;

const CHARGING_MODULE: &str = "g_mass_storage";
const UNLOAD_RETRIES: u32 = 3;
const UNLOAD_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct ModulesBackend;

impl ModulesBackend {
    pub fn new() -> Self {
        Self
    }

    /// The module backend is the fallback of last resort: it's always
    /// considered usable once probing reaches it (spec §4.C "Probing").
    pub fn is_usable(_root: &str) -> bool {
        true
    }

    fn currently_loaded() -> Result<Vec<String>> {
        let output = Command::new("lsmod")
            .output()
            .context("Failed to run lsmod")?;
        if !output.status.success() {
            bail!("lsmod exited with {:?}", output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_owned)
            .collect())
    }

    fn load(name: &str) -> Result<()> {
        debug!("Loading kernel module {name}");
        let status = Command::new("modprobe")
            .arg(name)
            .status()
            .with_context(|| format!("Failed to run modprobe {name}"))?;
        if !status.success() {
            bail!("modprobe {name} exited with {status:?}");
        }
        Ok(())
    }

    fn unload(name: &str) -> Result<()> {
        debug!("Unloading kernel module {name}");
        let status = Command::new("rmmod")
            .arg(name)
            .status()
            .with_context(|| format!("Failed to run rmmod {name}"))?;
        if !status.success() {
            bail!("rmmod {name} exited with {status:?}");
        }
        Ok(())
    }

    /// Unload whatever gadget module is currently loaded, then load `name`.
    /// Retries `UNLOAD_RETRIES` times; the caller is expected to have
    /// already broadcast a "really disconnect" event between tries (spec
    /// §4.B).
    fn switch_to(&self, name: &str) -> Result<()> {
        let loaded = Self::currently_loaded()?;

        for attempt in 1..=UNLOAD_RETRIES {
            let still_loaded: Vec<_> = loaded
                .iter()
                .filter(|m| m.starts_with("g_") && m.as_str() != name)
                .collect();

            if still_loaded.is_empty() {
                break;
            }

            let mut all_unloaded = true;
            for module in &still_loaded {
                if let Err(e) = Self::unload(module) {
                    warn!("Attempt {attempt}/{UNLOAD_RETRIES}: failed to unload {module}: {e}");
                    all_unloaded = false;
                }
            }

            if all_unloaded {
                break;
            }
            if attempt < UNLOAD_RETRIES {
                thread::sleep(UNLOAD_RETRY_DELAY);
            }
        }

        if !Self::currently_loaded()?.iter().any(|m| m == name) {
            Self::load(name)?;
        }

        Ok(())
    }

    fn apply_charging(&self) -> Result<()> {
        self.switch_to(CHARGING_MODULE)
    }

    fn apply_dynamic(&self, descriptor: &ModeDescriptor) -> Result<()> {
        let module = descriptor
            .mode_module
            .as_deref()
            .unwrap_or(CHARGING_MODULE);
        self.switch_to(module)
    }

    fn apply_undefined(&self) -> Result<()> {
        for module in Self::currently_loaded()?.iter().filter(|m| m.starts_with("g_")) {
            if let Err(e) = Self::unload(module) {
                warn!("Failed to unload {module} while clearing gadget: {e}");
            }
        }
        Ok(())
    }
}

impl Default for ModulesBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ModulesBackend {
    fn apply(&self, request: &ApplyRequest) -> Result<()> {
        match request {
            ApplyRequest::Charging => self.apply_charging(),
            ApplyRequest::Dynamic(d) => self.apply_dynamic(d),
            ApplyRequest::Undefined => self.apply_undefined(),
        }
    }

    fn current_functions(&self) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for module in Self::currently_loaded()?.iter().filter(|m| m.starts_with("g_")) {
            map.insert("gadget".to_owned(), module.clone());
        }
        Ok(map)
    }

    fn name(&self) -> &'static str {
        "modules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_usable_always_true() {
        assert!(ModulesBackend::is_usable("irrelevant"));
    }
}
