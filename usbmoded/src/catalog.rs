// SPDX-License-Identifier: GPL-3.0-only

//! The mode catalog (spec §4.E): scans a directory of `*.ini` files, each
//! describing one dynamic mode, and produces a sorted, validated list.
//!
//! Catalog reload is a two-step "build aside, swap in" dance: the main
//! thread builds a brand new `Catalog` off to the side and only replaces the
//! live one at a safe point (the engine calls `Catalog::install` between
//! mode transitions), so a currently-active mode keeps the descriptor
//! snapshot it started with until it's exited (spec §3 "Lifecycle").

use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::warn;

use crate::state::ModeDescriptor;

const SECTION: &str = "mode";

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Sorted alphabetically by mode name, so sub-action ordering during a
    /// reload is deterministic.
    modes: Vec<ModeDescriptor>,
}

impl Catalog {
    /// Scan `dir` for `*.ini` files and build a catalog from the ones that
    /// parse and pass the minimum-fields check. Malformed files are
    /// discarded with a warning; they never abort the scan.
    pub fn scan(dir: &Path) -> Self {
        let mut pattern = dir.to_path_buf();
        pattern.push("*.ini");

        let mut modes = vec![];

        let entries = match glob::glob(&pattern.to_string_lossy()) {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to scan mode catalog dir {dir:?}: {e}");
                return Self { modes };
            }
        };

        for path in entries.filter_map(|r| r.ok()) {
            match load_descriptor(&path) {
                Ok(Some(descriptor)) => modes.push(descriptor),
                Ok(None) => warn!("Discarding incomplete mode descriptor: {path:?}"),
                Err(e) => warn!("Failed to parse mode descriptor {path:?}: {e}"),
            }
        }

        modes.sort_by(|a, b| a.mode_name.cmp(&b.mode_name));

        Self { modes }
    }

    /// Load the diagnostic catalog, which is expected to contain exactly one
    /// descriptor (spec §4.E "Diagnostic mode").
    pub fn scan_diag(dir: &Path) -> Self {
        let catalog = Self::scan(dir);
        if catalog.modes.len() != 1 {
            warn!(
                "Diagnostic mode dir {dir:?} should contain exactly one descriptor, found {}",
                catalog.modes.len()
            );
        }
        catalog
    }

    pub fn modes(&self) -> &[ModeDescriptor] {
        &self.modes
    }

    pub fn get(&self, name: &str) -> Option<&ModeDescriptor> {
        self.modes.iter().find(|m| m.mode_name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.modes.iter().map(|m| m.mode_name.clone()).collect()
    }

    /// The single descriptor in a diagnostic catalog, if well-formed.
    pub fn diag_mode(&self) -> Option<&ModeDescriptor> {
        self.modes.first()
    }
}

fn load_descriptor(path: &PathBuf) -> anyhow::Result<Option<ModeDescriptor>> {
    let ini = Ini::load_from_file(path)?;

    let get = |key: &str| ini.get_from(Some(SECTION), key).map(str::to_owned);
    let get_bool = |key: &str| get(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);

    let mode_name = get("mode_name");
    let mode_module = get("mode_module");
    let appsync = get_bool("appsync");

    let Some(mode_name) = mode_name else {
        return Ok(None);
    };

    let descriptor = ModeDescriptor {
        mode_name,
        mode_module,
        sysfs_path: get("sysfs_path"),
        sysfs_value: get("sysfs_value"),
        sysfs_reset_value: get("sysfs_reset_value"),
        android_extra_sysfs: (1..=4)
            .filter_map(|n| {
                let path = get(&format!("android_extra_sysfs_path{n}"))?;
                let value = get(&format!("android_extra_sysfs_value{n}"))?;
                Some((path, value))
            })
            .collect(),
        id_product: get("idProduct"),
        id_vendor_override: get("idVendorOverride"),
        network: get_bool("network"),
        network_interface: get("network_interface"),
        mass_storage: get_bool("mass_storage"),
        appsync,
        nat: get_bool("nat"),
        dhcp_server: get_bool("dhcp_server"),
        connman_tethering: get("connman_tethering"),
    };

    // Spec §4.E: the file must at minimum name the mode, the trigger mode
    // name (here the mode name doubles as its own trigger), and a launcher
    // (appsync or a kernel module).
    if !descriptor.has_launcher() {
        return Ok(None);
    }

    Ok(Some(descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn scan_sorts_alphabetically_and_skips_incomplete_files() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "zmode.ini",
            "[mode]\nmode_name=zmode\nappsync=1\n",
        );
        write(
            dir.path(),
            "amode.ini",
            "[mode]\nmode_name=amode\nmode_module=g_ether\n",
        );
        write(dir.path(), "broken.ini", "[mode]\nsysfs_path=/foo\n");

        let catalog = Catalog::scan(dir.path());
        assert_eq!(catalog.names(), vec!["amode".to_owned(), "zmode".to_owned()]);
    }

    #[test]
    fn descriptor_without_launcher_is_discarded() {
        let dir = tempdir().unwrap();
        write(dir.path(), "nomode.ini", "[mode]\nmode_name=nomode\n");

        let catalog = Catalog::scan(dir.path());
        assert!(catalog.modes().is_empty());
    }

    #[test]
    fn extra_sysfs_pairs_are_collected_in_order() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "mtp.ini",
            "[mode]\nmode_name=mtp_mode\nappsync=1\n\
             android_extra_sysfs_path1=/sys/a\nandroid_extra_sysfs_value1=1\n\
             android_extra_sysfs_path2=/sys/b\nandroid_extra_sysfs_value2=0\n",
        );

        let catalog = Catalog::scan(dir.path());
        let mode = catalog.get("mtp_mode").unwrap();
        assert_eq!(
            mode.android_extra_sysfs,
            vec![
                ("/sys/a".to_owned(), "1".to_owned()),
                ("/sys/b".to_owned(), "0".to_owned())
            ]
        );
    }

    #[test]
    fn diag_catalog_warns_but_still_loads_single_entry() {
        let dir = tempdir().unwrap();
        write(dir.path(), "diag.ini", "[mode]\nmode_name=diag_mode\nappsync=1\n");

        let catalog = Catalog::scan_diag(dir.path());
        assert_eq!(catalog.diag_mode().unwrap().mode_name, "diag_mode");
    }
}
