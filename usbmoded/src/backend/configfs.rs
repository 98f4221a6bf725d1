// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The configfs/UDC actuator (spec §4.A), generalized from the teacher's
//! single-purpose mass-storage `UsbGadget`/`MassStorageFunction` into a
//! gadget actuator that can assemble an arbitrary function list, set
//! vendor/product ids, and write descriptor-provided extra sysfs
//! attributes, in addition to mass-storage LUN management.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    io::{self, IoSlice},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use cap_std::{ambient_authority, fs::Dir};
use tracing::{debug, warn};

use crate::backend::{ApplyRequest, Backend};
use crate::state::ModeDescriptor;
use crate::util::{self, CONFIGFS_MAGIC};

const CONFIG_NAME: &str = "c.1";

fn open_dir(path: &Path) -> Result<Dir> {
    Dir::open_ambient_dir(path, ambient_authority())
        .and_then(|d| util::check_fs_magic(d, CONFIGFS_MAGIC))
        .with_context(|| format!("Failed to open directory: {path:?}"))
}

fn rel_dir(parent_path: &Path, parent: &Dir, rel: &Path) -> Result<(PathBuf, Dir)> {
    let dir = parent
        .open_dir(rel)
        .and_then(|d| util::check_fs_magic(d, CONFIGFS_MAGIC))
        .with_context(|| format!("Failed to open directory: {:?}", parent_path.join(rel)))?;
    Ok((parent_path.join(rel), dir))
}

/// Append a newline and write. Per spec §4.A, a nonexistent target is a
/// warning that reports failure, not a panic.
fn write_file(dir_path: &Path, dir: &Dir, rel: &Path, value: &str) -> Result<()> {
    let full_path = dir_path.join(rel);
    (|| -> Result<()> {
        let mut file = dir
            .create(rel)
            .and_then(|f| util::check_fs_magic(f, CONFIGFS_MAGIC))?;
        let bufs = [IoSlice::new(value.as_bytes()), IoSlice::new(b"\n")];
        let n = std::io::Write::write_vectored(&mut file, &bufs)?;
        if n != value.len() + 1 {
            anyhow::bail!("short write");
        }
        Ok(())
    })()
    .with_context(|| format!("Failed to write configfs file: {full_path:?}"))
}

pub struct ConfigfsBackend {
    root: PathBuf,
    function_map: BTreeMap<String, String>,
}

impl ConfigfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let function_map = super::default_function_map()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Self {
            root: root.into(),
            function_map,
        }
    }

    /// Overrides the function name map (spec §4.A: "configurable via the
    /// settings store").
    pub fn with_function_map(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.function_map.extend(overrides);
        self
    }

    /// configfs is usable iff the gadget base directory and its UDC control
    /// file both exist (spec §4.C "Probing").
    pub fn is_usable(root: &str) -> bool {
        Path::new(root).is_dir() && Path::new(root).join("UDC").exists()
    }

    fn gadget_dir(&self) -> Result<(PathBuf, Dir)> {
        let dir = open_dir(&self.root)?;
        Ok((self.root.clone(), dir))
    }

    fn function_dir_name(&self, logical_name: &str) -> String {
        self.function_map
            .get(logical_name)
            .cloned()
            .unwrap_or_else(|| logical_name.to_owned())
    }

    /// Pick the first entry in `/sys/class/udc`.
    fn first_udc() -> Result<Option<String>> {
        let udc_dir = Path::new("/sys/class/udc");
        if !udc_dir.is_dir() {
            return Ok(None);
        }
        for entry in std::fs::read_dir(udc_dir).context("Failed to list /sys/class/udc")? {
            let entry = entry.context("Failed to read /sys/class/udc entry")?;
            return Ok(entry.file_name().into_string().ok());
        }
        Ok(None)
    }

    fn set_udc(&self, enable: bool) -> Result<()> {
        let (path, dir) = self.gadget_dir()?;
        let current = std::fs::read_to_string(path.join("UDC")).unwrap_or_default();
        let current = current.trim();

        let desired = if enable {
            Self::first_udc()?.ok_or_else(|| anyhow!("No UDC available"))?
        } else {
            String::new()
        };

        if current == desired {
            return Ok(());
        }

        write_file(&path, &dir, Path::new("UDC"), &desired)
    }

    fn clear_functions(&self) -> Result<()> {
        let (path, dir) = self.gadget_dir()?;
        let (config_path, config_dir) = rel_dir(&path, &dir, Path::new("configs").join(CONFIG_NAME).as_path())?;

        let entries: Vec<OsString> = config_dir
            .entries()
            .with_context(|| format!("Failed to read directory: {config_path:?}"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_symlink()).unwrap_or(false))
            .map(|e| e.file_name())
            .collect();

        for name in entries {
            if let Err(e) = config_dir.remove_file(&name) {
                warn!("Failed to remove function symlink {:?}: {e}", config_path.join(&name));
            }
        }

        Ok(())
    }

    /// Disable UDC, clear existing function symlinks, then symlink each
    /// named function into the active config (spec §4.A `set_function`).
    /// `None` / empty clears the function list (writing "none" is treated
    /// as silent success, matching the kernel's EINVAL-on-empty quirk).
    fn set_function(&self, names: Option<&str>) -> Result<()> {
        self.set_udc(false)?;
        self.clear_functions()?;

        let Some(names) = names.filter(|n| !n.is_empty() && *n != "none") else {
            return Ok(());
        };

        let (path, dir) = self.gadget_dir()?;
        let (config_path, config_dir) = rel_dir(&path, &dir, Path::new("configs").join(CONFIG_NAME).as_path())?;

        for logical_name in names.split(',') {
            let function_name = self.function_dir_name(logical_name);
            let function_path = self.root.join("functions").join(&function_name);

            match config_dir.symlink_contents(&function_path, &function_name) {
                Ok(()) => debug!("Linked function {function_name} into config"),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to link function: {:?}", config_path.join(&function_name))
                    })
                }
            }
        }

        Ok(())
    }

    fn set_vendor_id(&self, id: &str) -> Result<()> {
        let (path, dir) = self.gadget_dir()?;
        write_file(&path, &dir, Path::new("idVendor"), &format!("0x{}", canonicalize_hex(id)))
    }

    fn set_product_id(&self, id: &str) -> Result<()> {
        let (path, dir) = self.gadget_dir()?;
        write_file(&path, &dir, Path::new("idProduct"), &format!("0x{}", canonicalize_hex(id)))
    }

    fn write_extra_sysfs(&self, pairs: &[(String, String)]) -> Result<()> {
        for (path, value) in pairs {
            if let Err(e) = std::fs::write(path, format!("{value}\n")) {
                warn!("Failed to write extra sysfs attribute {path:?}: {e}");
            }
        }
        Ok(())
    }

    fn apply_charging(&self) -> Result<()> {
        self.set_function(Some("mass_storage"))?;
        self.set_product_id(CHARGING_FUNCTION_PRODUCT_ID)?;
        self.set_udc(true)
    }

    fn apply_dynamic(&self, descriptor: &ModeDescriptor) -> Result<()> {
        let functions = if descriptor.mass_storage {
            "mass_storage".to_owned()
        } else {
            descriptor
                .mode_name
                .split(',')
                .next()
                .unwrap_or(&descriptor.mode_name)
                .to_owned()
        };

        self.set_function(Some(&functions))?;

        if let Some(id) = &descriptor.id_vendor_override {
            self.set_vendor_id(id)?;
        }
        if let Some(id) = &descriptor.id_product {
            self.set_product_id(id)?;
        }

        self.write_extra_sysfs(&descriptor.android_extra_sysfs)?;

        self.set_udc(true)
    }

    fn apply_undefined(&self) -> Result<()> {
        self.set_udc(false)?;
        self.set_function(None)
    }
}

// Default product id while charging only; real deployments override this
// via settings, but a sane literal default keeps the backend self-contained.
const CHARGING_FUNCTION_PRODUCT_ID: &str = "afff";

fn canonicalize_hex(id: &str) -> String {
    let trimmed = id.trim_start_matches("0x").trim_start_matches("0X");
    format!("{:0>4}", trimmed.to_ascii_lowercase())
}

impl Backend for ConfigfsBackend {
    fn apply(&self, request: &ApplyRequest) -> Result<()> {
        match request {
            ApplyRequest::Charging => self.apply_charging(),
            ApplyRequest::Dynamic(d) => self.apply_dynamic(d),
            ApplyRequest::Undefined => self.apply_undefined(),
        }
    }

    fn current_functions(&self) -> Result<BTreeMap<String, String>> {
        let (path, dir) = self.gadget_dir()?;
        let (config_path, config_dir) =
            rel_dir(&path, &dir, Path::new("configs").join(CONFIG_NAME).as_path())?;

        let mut functions = BTreeMap::new();

        for entry in config_dir
            .entries()
            .with_context(|| format!("Failed to read directory: {config_path:?}"))?
        {
            let entry = entry?;
            if !entry.file_type().map(|t| t.is_symlink()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            functions.insert(CONFIG_NAME.to_owned(), name);
        }

        Ok(functions)
    }

    fn name(&self) -> &'static str {
        "configfs"
    }
}

/// Mass-storage LUN management, kept close to the teacher's
/// `MassStorageFunction` since the logic (lun.N subdirectories, cdrom/ro/file
/// attributes) doesn't change under generalization.
pub struct MassStorageFunction {
    path: PathBuf,
    dir: Dir,
}

impl MassStorageFunction {
    pub fn open(gadget_root: &Path, function_name: &OsStr) -> Result<Option<Self>> {
        let (root_path, root_dir) = (gadget_root.to_path_buf(), open_dir(gadget_root)?);
        match rel_dir(&root_path, &root_dir, Path::new("functions").join(function_name).as_path()) {
            Ok((path, dir)) => Ok(Some(Self { path, dir })),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<io::Error>() {
                    if io_err.kind() == io::ErrorKind::NotFound {
                        return Ok(None);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn luns(&self) -> Result<Vec<u8>> {
        let mut result = vec![];
        for entry in self
            .dir
            .entries()
            .with_context(|| format!("Failed to read directory: {:?}", self.path))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix("lun.") else { continue };
            if let Ok(n) = suffix.parse::<u8>() {
                result.push(n);
            }
        }
        Ok(result)
    }

    pub fn create_lun(&self, lun: u8) -> Result<bool> {
        let name = format!("lun.{lun}");
        match self.dir.create_dir(&name) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create LUN: {:?}", self.path.join(name))),
        }
    }

    pub fn delete_lun(&self, lun: u8) -> Result<bool> {
        let name = format!("lun.{lun}");
        match self.dir.remove_dir(&name) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete LUN: {:?}", self.path.join(name))),
        }
    }

    pub fn set_lun_file(&self, lun: u8, file: &Path, cdrom: bool, ro: bool) -> Result<()> {
        let name = format!("lun.{lun}");
        let base = Path::new(&name);

        write_file(&self.path, &self.dir, &base.join("cdrom"), if cdrom { "1" } else { "0" })?;
        write_file(&self.path, &self.dir, &base.join("ro"), if ro { "1" } else { "0" })?;
        write_file(&self.path, &self.dir, &base.join("file"), &file.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_hex_pads_and_lowercases() {
        assert_eq!(canonicalize_hex("0x5c6"), "05c6");
        assert_eq!(canonicalize_hex("ABCD"), "abcd");
        assert_eq!(canonicalize_hex("1"), "0001");
    }

    #[test]
    fn is_usable_false_for_missing_root() {
        assert!(!ConfigfsBackend::is_usable("/nonexistent/gadget/root"));
    }
}
