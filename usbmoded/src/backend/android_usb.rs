// SPDX-License-Identifier: GPL-3.0-only

//! The legacy `android_usb` sysfs actuator (spec §4.A/§4.B), used on older
//! Android kernels that predate configfs gadgets. The tree looks like
//! `<root>/enable`, `<root>/state`, `<root>/idVendor`, `<root>/idProduct`,
//! `<root>/functions` (comma-separated).

use std::{collections::BTreeMap, fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::backend::{ApplyRequest, Backend};
use crate::state::ModeDescriptor;

pub struct AndroidUsbBackend {
    root: PathBuf,
}

impl AndroidUsbBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// android_usb is usable iff its `enable` control file exists (spec
    /// §4.C "Probing").
    pub fn is_usable(root: &str) -> bool {
        PathBuf::from(root).join("enable").exists()
    }

    fn write(&self, rel: &str, value: &str) -> Result<()> {
        let path = self.root.join(rel);
        fs::write(&path, format!("{value}\n"))
            .with_context(|| format!("Failed to write android_usb file: {path:?}"))
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.root.join(rel))
            .ok()
            .map(|s| s.trim().to_owned())
    }

    fn set_enable(&self, enable: bool) -> Result<()> {
        self.write("enable", if enable { "1" } else { "0" })
    }

    fn set_functions(&self, functions: &str) -> Result<()> {
        self.set_enable(false)?;
        self.write("functions", functions)
    }

    fn apply_charging(&self) -> Result<()> {
        self.set_functions("mass_storage")?;
        self.set_enable(true)
    }

    fn apply_dynamic(&self, descriptor: &ModeDescriptor) -> Result<()> {
        let functions = if descriptor.mass_storage {
            "mass_storage".to_owned()
        } else {
            descriptor.mode_name.clone()
        };

        self.set_functions(&functions)?;

        if let Some(id) = &descriptor.id_vendor_override {
            self.write("idVendor", id)?;
        }
        if let Some(id) = &descriptor.id_product {
            self.write("idProduct", id)?;
        }

        for (path, value) in &descriptor.android_extra_sysfs {
            if let Err(e) = fs::write(path, format!("{value}\n")) {
                debug!("Failed to write extra sysfs attribute {path:?}: {e}");
            }
        }

        self.set_enable(true)
    }

    fn apply_undefined(&self) -> Result<()> {
        self.set_enable(false)
    }
}

impl Backend for AndroidUsbBackend {
    fn apply(&self, request: &ApplyRequest) -> Result<()> {
        match request {
            ApplyRequest::Charging => self.apply_charging(),
            ApplyRequest::Dynamic(d) => self.apply_dynamic(d),
            ApplyRequest::Undefined => self.apply_undefined(),
        }
    }

    fn current_functions(&self) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        if let Some(functions) = self.read("functions") {
            map.insert("android0".to_owned(), functions);
        }
        Ok(map)
    }

    fn name(&self) -> &'static str {
        "android_usb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_usable_false_without_enable_file() {
        assert!(!AndroidUsbBackend::is_usable("/nonexistent/android0"));
    }
}
