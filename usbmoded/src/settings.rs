// SPDX-License-Identifier: GPL-3.0-only

//! The settings store (spec §4.D): a layered INI where a read-only directory
//! of static files is overlaid by a single writable file, plus one-time
//! migration of a legacy single-file config.
//!
//! Built on the `ini` crate, which keeps sections/keys in insertion order —
//! the same property the teacher's configfs code relies on for directory
//! iteration order, just applied to key/value merging here.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ini::Ini;
use tracing::{debug, info, warn};

/// First per-user UID in the "additional user" range. Below this (and above
/// 0) is the device owner; per-user key overrides only apply at or above
/// this boundary (spec §3 "Per-user variants").
pub const ADDITIONAL_USER_UID_MIN: u32 = 100000;

const DEFAULT_GROUP: &str = "usbmode";
const DEFAULT_MODE_KEY: &str = "mode";
const HIDDEN_KEY: &str = "hide_mode";
const WHITELIST_KEY: &str = "whitelist";

pub struct Settings {
    config_dir: PathBuf,
    overlay_path: PathBuf,
    /// Static files merged in glob order, seeded with the built-in default.
    static_ini: Ini,
    /// The writable overlay, loaded from `overlay_path` if present.
    overlay: Ini,
}

fn is_non_owner_uid(uid: u32) -> bool {
    uid >= ADDITIONAL_USER_UID_MIN
}

fn user_key(key: &str, uid: u32) -> String {
    format!("{key}_{uid}")
}

fn get(ini: &Ini, group: &str, key: &str) -> Option<String> {
    ini.get_from(Some(group), key).map(str::to_owned)
}

impl Settings {
    /// Load the static layer (glob-merged, seeded with `usbmode.mode=ask`)
    /// and the dynamic overlay, migrating a legacy single-file config if
    /// present and the overlay doesn't exist yet (spec §4.D).
    pub fn load(config_dir: impl Into<PathBuf>, overlay_path: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        let overlay_path = overlay_path.into();

        let mut static_ini = Ini::new();
        static_ini.set_to(Some(DEFAULT_GROUP), DEFAULT_MODE_KEY.to_owned(), "ask".to_owned());

        let mut pattern = config_dir.clone();
        pattern.push("*.ini");
        let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .context("Failed to build glob pattern for static config dir")?
            .filter_map(|r| r.ok())
            .collect();
        paths.sort();

        for path in &paths {
            match Ini::load_from_file(path) {
                Ok(file) => {
                    merge_into(&mut static_ini, &file);
                    debug!("Merged static config: {path:?}");
                }
                Err(e) => warn!("Failed to parse static config {path:?}, skipping: {e}"),
            }
        }

        let legacy_path = config_dir.join("usb-moded.ini");
        if legacy_path.is_file() {
            if !overlay_path.is_file() {
                info!("Migrating legacy config {legacy_path:?} into overlay");
                match Ini::load_from_file(&legacy_path) {
                    Ok(mut legacy) => {
                        // A legacy `mode = ask` entry would otherwise
                        // shadow whatever the static files decided, so drop
                        // it before writing to the overlay (spec §4.D).
                        legacy.delete_from(Some(DEFAULT_GROUP), DEFAULT_MODE_KEY);
                        if let Err(e) = write_ini_if_changed(&overlay_path, &legacy) {
                            warn!("Failed to migrate legacy config: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to parse legacy config {legacy_path:?}: {e}"),
                }
            } else {
                warn!("Both legacy config and overlay exist; ignoring legacy config {legacy_path:?}");
            }
        }

        let overlay = if overlay_path.is_file() {
            Ini::load_from_file(&overlay_path)
                .with_context(|| format!("Failed to parse overlay: {overlay_path:?}"))?
        } else {
            Ini::new()
        };

        Ok(Self {
            config_dir,
            overlay_path,
            static_ini,
            overlay,
        })
    }

    /// The merged view: overlay masks static.
    fn merged(&self) -> Ini {
        let mut merged = self.static_ini.clone();
        merge_into(&mut merged, &self.overlay);
        merged
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<String> {
        get(&self.overlay, group, key).or_else(|| get(&self.static_ini, group, key))
    }

    pub fn get_int(&self, group: &str, key: &str) -> Option<i64> {
        self.get_string(group, key)?.parse().ok()
    }

    /// Try `key_<uid>` first when `uid` is a non-owner user, falling back to
    /// the plain key (spec §4.D `get_user_string`).
    pub fn get_user_string(&self, group: &str, key: &str, uid: u32) -> Option<String> {
        if is_non_owner_uid(uid) {
            if let Some(v) = self.get_string(group, &user_key(key, uid)) {
                return Some(v);
            }
        }
        self.get_string(group, key)
    }

    /// Compare against the merged view; if `value` differs, write it to the
    /// overlay (purging entries that duplicate static values) and report
    /// whether anything changed.
    pub fn set(&mut self, group: &str, key: &str, value: &str) -> Result<bool> {
        if self.get_string(group, key).as_deref() == Some(value) {
            return Ok(false);
        }

        self.overlay
            .set_to(Some(group), key.to_owned(), value.to_owned());
        self.save()?;
        Ok(true)
    }

    pub fn set_user(&mut self, group: &str, key: &str, uid: u32, value: &str) -> Result<bool> {
        if is_non_owner_uid(uid) {
            self.set(group, &user_key(key, uid), value)
        } else {
            self.set(group, key, value)
        }
    }

    /// Remove every `key_<uid>` override for `uid` from the overlay.
    pub fn clear_user(&mut self, uid: u32) -> Result<()> {
        let suffix = format!("_{uid}");
        let mut to_delete = vec![];

        for (section, props) in self.overlay.iter() {
            let Some(section) = section else { continue };
            for (key, _) in props.iter() {
                if key.ends_with(&suffix) {
                    to_delete.push((section.to_owned(), key.to_owned()));
                }
            }
        }

        for (section, key) in to_delete {
            self.overlay.delete_from(Some(&section), &key);
        }

        self.save()
    }

    /// The default mode for `uid`. Unknown-validity values are rewritten to
    /// `ask`; an entirely absent value defaults to `charging_only` (spec
    /// §4.D `get_mode_setting`).
    pub fn get_mode_setting(&mut self, uid: u32, is_valid: impl Fn(&str) -> bool) -> Result<String> {
        let Some(value) = self.get_user_string(DEFAULT_GROUP, DEFAULT_MODE_KEY, uid) else {
            return Ok("charging_only".to_owned());
        };

        if value == "ask" || is_valid(&value) {
            return Ok(value);
        }

        warn!("Stored mode {value:?} for uid {uid} is no longer valid, resetting to ask");
        self.set_user(DEFAULT_GROUP, DEFAULT_MODE_KEY, uid, "ask")?;
        Ok("ask".to_owned())
    }

    fn comma_list(&self, group: &str, key: &str) -> Vec<String> {
        self.get_string(group, key)
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn hidden_modes(&self) -> Vec<String> {
        self.comma_list(DEFAULT_GROUP, HIDDEN_KEY)
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.comma_list(DEFAULT_GROUP, WHITELIST_KEY)
    }

    fn set_comma_list(&mut self, group: &str, key: &str, list: &[String]) -> Result<bool> {
        self.set(group, key, &list.join(","))
    }

    pub fn set_hidden(&mut self, hidden: &[String]) -> Result<bool> {
        self.set_comma_list(DEFAULT_GROUP, HIDDEN_KEY, hidden)
    }

    pub fn set_whitelist(&mut self, whitelist: &[String]) -> Result<bool> {
        self.set_comma_list(DEFAULT_GROUP, WHITELIST_KEY, whitelist)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Rewrite the overlay only if the serialized content differs from what
    /// is on disk, and only after purging entries that duplicate the static
    /// layer and dropping groups left empty by the purge (spec §4.D
    /// invariants).
    fn save(&mut self) -> Result<()> {
        purge_duplicates(&mut self.overlay, &self.static_ini);
        drop_empty_groups(&mut self.overlay);

        if let Some(parent) = self.overlay_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }

        let legacy_path = self.config_dir.join("usb-moded.ini");
        if legacy_path.is_file() {
            let _ = fs::remove_file(&legacy_path);
        }

        write_ini_if_changed(&self.overlay_path, &self.overlay)
    }
}

/// Add (or move to the end, if already present) an entry in a comma list,
/// preserving order and uniqueness.
pub fn list_add(list: &[String], entry: &str) -> Vec<String> {
    let mut out: Vec<String> = list.iter().filter(|e| e.as_str() != entry).cloned().collect();
    out.push(entry.to_owned());
    out
}

/// Remove an entry from a comma list, preserving order.
pub fn list_remove(list: &[String], entry: &str) -> Vec<String> {
    list.iter().filter(|e| e.as_str() != entry).cloned().collect()
}

fn merge_into(dest: &mut Ini, src: &Ini) {
    for (section, props) in src.iter() {
        for (key, value) in props.iter() {
            dest.set_to(section, key.to_owned(), value.to_owned());
        }
    }
}

fn purge_duplicates(overlay: &mut Ini, static_ini: &Ini) {
    let mut to_delete = vec![];

    for (section, props) in overlay.iter() {
        let Some(section) = section else { continue };
        for (key, value) in props.iter() {
            if get(static_ini, section, key).as_deref() == Some(value) {
                to_delete.push((section.to_owned(), key.to_owned()));
            }
        }
    }

    for (section, key) in to_delete {
        overlay.delete_from(Some(&section), &key);
    }
}

fn drop_empty_groups(ini: &mut Ini) {
    let empty: Vec<String> = ini
        .iter()
        .filter_map(|(section, props)| {
            let section = section?;
            if props.iter().next().is_none() {
                Some(section.to_owned())
            } else {
                None
            }
        })
        .collect();

    for section in empty {
        ini.delete(Some(&section));
    }
}

fn write_ini_if_changed(path: &Path, ini: &Ini) -> Result<()> {
    let mut buf = Vec::new();
    ini.write_to(&mut buf)
        .with_context(|| format!("Failed to serialize: {path:?}"))?;

    if let Ok(existing) = fs::read(path) {
        if existing == buf {
            return Ok(());
        }
    }

    fs::write(path, &buf).with_context(|| format!("Failed to write: {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn static_files_merge_in_glob_order_with_default_seed() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("10-base.ini"), "[usbmode]\nwhitelist=mtp_mode\n");

        let settings = Settings::load(dir.path(), dir.path().join("overlay.ini")).unwrap();
        assert_eq!(settings.get_string("usbmode", "mode"), Some("ask".to_owned()));
        assert_eq!(settings.whitelist(), vec!["mtp_mode".to_owned()]);
    }

    #[test]
    fn overlay_masks_static_and_purges_on_save() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("10-base.ini"), "[usbmode]\nmode=charging_only\n");
        let overlay_path = dir.path().join("overlay.ini");

        let mut settings = Settings::load(dir.path(), &overlay_path).unwrap();
        assert!(settings.set("usbmode", "mode", "mtp_mode").unwrap());
        assert_eq!(settings.get_string("usbmode", "mode"), Some("mtp_mode".to_owned()));

        // Setting back to the static value should purge the overlay entry.
        assert!(settings.set("usbmode", "mode", "charging_only").unwrap());
        let raw = fs::read_to_string(&overlay_path).unwrap();
        assert!(!raw.contains("mode"), "overlay should not duplicate static value: {raw}");
    }

    #[test]
    fn save_is_idempotent_when_nothing_changed() {
        let dir = tempdir().unwrap();
        let overlay_path = dir.path().join("overlay.ini");
        let mut settings = Settings::load(dir.path(), &overlay_path).unwrap();

        assert!(settings.set("usbmode", "mode", "mtp_mode").unwrap());
        assert!(!settings.set("usbmode", "mode", "mtp_mode").unwrap());
    }

    #[test]
    fn per_user_override_applies_only_for_additional_users() {
        let dir = tempdir().unwrap();
        let overlay_path = dir.path().join("overlay.ini");
        let mut settings = Settings::load(dir.path(), &overlay_path).unwrap();

        settings.set("usbmode", "mode", "mtp_mode").unwrap();
        settings
            .set_user("usbmode", "mode", ADDITIONAL_USER_UID_MIN, "charging_only")
            .unwrap();

        assert_eq!(
            settings.get_user_string("usbmode", "mode", ADDITIONAL_USER_UID_MIN),
            Some("charging_only".to_owned())
        );
        // Owner (uid below the additional-user range) is unaffected.
        assert_eq!(settings.get_user_string("usbmode", "mode", 0), Some("mtp_mode".to_owned()));
    }

    #[test]
    fn mode_setting_resets_invalid_value_to_ask() {
        let dir = tempdir().unwrap();
        let overlay_path = dir.path().join("overlay.ini");
        let mut settings = Settings::load(dir.path(), &overlay_path).unwrap();

        settings.set("usbmode", "mode", "no_longer_installed").unwrap();
        let result = settings.get_mode_setting(0, |m| m == "mtp_mode").unwrap();
        assert_eq!(result, "ask");
        assert_eq!(settings.get_string("usbmode", "mode"), Some("ask".to_owned()));
    }

    #[test]
    fn mode_setting_defaults_to_charging_only_when_absent() {
        let dir = tempdir().unwrap();
        let overlay_path = dir.path().join("overlay.ini");
        let mut settings = Settings::load(dir.path(), &overlay_path).unwrap();
        // Remove the built-in default to exercise the "nothing stored" path.
        settings.static_ini.delete_from(Some("usbmode"), "mode");

        let result = settings.get_mode_setting(0, |_| false).unwrap();
        assert_eq!(result, "charging_only");
    }

    #[test]
    fn list_helpers_preserve_order_and_round_trip() {
        let list = vec!["a".to_owned(), "b".to_owned()];
        let added = list_add(&list, "c");
        assert_eq!(added, vec!["a", "b", "c"]);

        let removed = list_remove(&added, "c");
        assert_eq!(removed, list);
    }

    #[test]
    fn legacy_file_migrates_into_overlay_once() {
        let dir = tempdir().unwrap();
        write_file(
            &dir.path().join("usb-moded.ini"),
            "[usbmode]\nmode=ask\nwhitelist=mtp_mode\n",
        );
        let overlay_path = dir.path().join("overlay.ini");

        let settings = Settings::load(dir.path(), &overlay_path).unwrap();
        // Legacy `mode = ask` is dropped; whitelist carries over.
        assert_eq!(settings.whitelist(), vec!["mtp_mode".to_owned()]);
        assert!(!dir.path().join("usb-moded.ini").exists());
    }
}
