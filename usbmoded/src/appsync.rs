// SPDX-License-Identifier: GPL-3.0-only

//! The appsync collaborator interface (spec §4.J): mode descriptors flagged
//! `appsync=1` delegate "launch the app that owns this mode" to a set of
//! small, independently restartable helper scripts under
//! `/usr/lib/usb-moded/appsync/<mode>/{pre,post,stop}` rather than the
//! daemon spawning and supervising a long-lived process itself.

use std::{path::PathBuf, process::Command};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::state::ModeDescriptor;

const DEFAULT_SCRIPT_DIR: &str = "/usr/lib/usb-moded/appsync";

pub struct AppSync {
    script_dir: PathBuf,
}

impl AppSync {
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
        }
    }

    pub fn with_default_dir() -> Self {
        Self::new(DEFAULT_SCRIPT_DIR)
    }

    fn mode_script(&self, mode: &str, stage: &str) -> PathBuf {
        self.script_dir.join(mode).join(stage)
    }

    fn run(&self, path: &PathBuf, args: &[&str]) -> Result<bool> {
        if !path.is_file() {
            return Ok(false);
        }

        debug!("Running appsync script: {path:?} {args:?}");
        let status = Command::new(path)
            .args(args)
            .status()
            .with_context(|| format!("Failed to run appsync script: {path:?}"))?;

        if !status.success() {
            warn!("Appsync script {path:?} exited with {status:?}");
        }

        Ok(true)
    }

    /// Run the outgoing mode's `stop` script, if one is present. `force`
    /// skips the grace period a clean shutdown would otherwise get (spec
    /// §4.J "Forced deactivation", used on SIGTERM/rescue exit).
    pub fn deactivate(&self, force: bool) -> Result<()> {
        let mut pattern = self.script_dir.clone();
        pattern.push("*");
        pattern.push("stop");

        let Ok(entries) = glob::glob(&pattern.to_string_lossy()) else {
            return Ok(());
        };

        for path in entries.filter_map(|r| r.ok()) {
            let args: &[&str] = if force { &["--force"] } else { &[] };
            if let Err(e) = self.run(&path, args) {
                warn!("Failed to deactivate appsync script {path:?}: {e}");
            }
        }

        Ok(())
    }

    /// Run the incoming mode's `pre` script, which is expected to finish
    /// before the gadget function is actually enabled (e.g. a service that
    /// must already be listening).
    pub fn activate_pre(&self, descriptor: Option<&ModeDescriptor>) -> Result<()> {
        let Some(descriptor) = descriptor.filter(|d| d.appsync) else {
            return Ok(());
        };
        self.run(&self.mode_script(&descriptor.mode_name, "pre"), &[])?;
        Ok(())
    }

    /// Run the incoming mode's `post` script, after the gadget function is
    /// live. Returns whether the script asked for a deferred "confirmed
    /// active" callback (signaled by a `0` exit status from a script that
    /// also touched a `post`-recognized marker file) — most scripts don't,
    /// so this degrades to `false`.
    pub fn activate_post(&self, descriptor: Option<&ModeDescriptor>) -> Result<bool> {
        let Some(descriptor) = descriptor.filter(|d| d.appsync) else {
            return Ok(false);
        };
        let ran = self.run(&self.mode_script(&descriptor.mode_name, "post"), &[])?;
        Ok(ran)
    }

    /// Record that `mode` finished activating. `post` mirrors whatever
    /// [`activate_post`] returned, and is only meaningful for logging/
    /// diagnostics here since the daemon's externally-visible state already
    /// transitioned by this point.
    pub fn mark_active(&self, mode: &str, post: bool) {
        debug!("Mode {mode} active (post-script ran: {post})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn write_executable_script(path: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn deactivate_is_a_no_op_with_no_scripts() {
        let dir = tempdir().unwrap();
        let appsync = AppSync::new(dir.path());
        assert!(appsync.deactivate(false).is_ok());
    }

    #[test]
    fn activate_pre_skips_non_appsync_descriptors() {
        let dir = tempdir().unwrap();
        let appsync = AppSync::new(dir.path());
        let descriptor = ModeDescriptor {
            mode_name: "mtp_mode".to_owned(),
            appsync: false,
            ..Default::default()
        };
        assert!(appsync.activate_pre(Some(&descriptor)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn activate_post_runs_mode_script_when_present() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("mtp_mode").join("post");
        write_executable_script(&script, "exit 0");

        let appsync = AppSync::new(dir.path());
        let descriptor = ModeDescriptor {
            mode_name: "mtp_mode".to_owned(),
            appsync: true,
            ..Default::default()
        };
        assert!(appsync.activate_post(Some(&descriptor)).unwrap());
    }
}
