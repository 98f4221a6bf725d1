// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Shared utilities: filesystem-magic sanity checks, process lookup,
//! `/proc/cmdline` parsing, wake-locks, and the cancellable-wait primitive
//! the worker uses for every blocking step (spec §4.H, §5, §9).

use std::{
    ffi::OsString,
    fs, io,
    os::fd::{AsFd, OwnedFd},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use cap_std::{
    ambient_authority,
    fs::{Dir, ReadDir},
};
use rustix::{
    io::Errno,
    process::{Pid, Signal},
};
use tracing::{debug, warn};

pub const CONFIGFS_MAGIC: u32 = 0x62656570;
pub const PROC_SUPER_MAGIC: u32 = 0x9fa0;
pub const SYSFS_MAGIC: u32 = 0x62656572;

/// Ensure that the fd refers to a file that lives on the specified type of
/// filesystem. This prevents reading a "fake" file backed by FUSE or similar.
pub fn check_fs_magic<T: AsFd>(fd: T, magic: u32) -> io::Result<T> {
    let statfs = rustix::fs::fstatfs(&fd)?;

    // f_type has different types on different architectures.
    if statfs.f_type as u32 != magic {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Cannot trust due to bad filesystem magic",
        ));
    }

    Ok(fd)
}

// The NDK has the pidfd constants, but the libc crate doesn't yet, so rustix
// doesn't enable the functionality for Android.

#[cfg(target_os = "linux")]
#[inline]
pub fn pidfd_open(pid: Pid) -> Result<OwnedFd, Errno> {
    use rustix::process::PidfdFlags;

    rustix::process::pidfd_open(pid, PidfdFlags::empty())
}

#[cfg(target_os = "android")]
#[inline]
pub fn pidfd_open(pid: Pid) -> Result<OwnedFd, Errno> {
    use std::os::fd::FromRawFd;

    unsafe {
        // Same syscall number on every architecture.
        let ret = libc::syscall(434, pid, 0);
        if ret == -1 {
            return Err(Errno::from_raw_os_error(*libc::__errno()));
        }

        Ok(OwnedFd::from_raw_fd(ret as i32))
    }
}

#[cfg(target_os = "linux")]
#[inline]
pub fn pidfd_send_signal<Fd: AsFd>(pidfd: Fd, sig: Signal) -> Result<(), Errno> {
    rustix::process::pidfd_send_signal(pidfd, sig)
}

#[cfg(target_os = "android")]
#[inline]
pub fn pidfd_send_signal<Fd: AsFd>(pidfd: Fd, sig: Signal) -> Result<(), Errno> {
    unsafe {
        // Same syscall number on every architecture.
        let ret = libc::syscall(424, pidfd.as_fd(), sig, 0usize, 0u32);
        if ret == -1 {
            return Err(Errno::from_raw_os_error(*libc::__errno()));
        }

        Ok(())
    }
}

/// Iterate through all PIDs, yielding a pidfd and the process executable name.
/// Kernel threads, PIDs that disappear during procfs traversal, and PIDs that
/// cannot be read due to permissions are ignored.
pub struct ProcessIter {
    dir: Dir,
    entries: ReadDir,
}

impl ProcessIter {
    pub fn new() -> io::Result<Self> {
        let dir = Dir::open_ambient_dir("/proc", ambient_authority())
            .and_then(|d| check_fs_magic(d, PROC_SUPER_MAGIC))?;
        let entries = dir.entries()?;

        Ok(Self { dir, entries })
    }
}

impl Iterator for ProcessIter {
    type Item = io::Result<(OwnedFd, OsString)>;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in &mut self.entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };

            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
                .and_then(Pid::from_raw)
            else {
                continue;
            };

            let pidfd = match pidfd_open(pid) {
                Ok(c) => c,
                Err(e)
                    if e.kind() == io::ErrorKind::NotFound
                        || e.kind() == io::ErrorKind::PermissionDenied =>
                {
                    continue
                }
                Err(e) => return Some(Err(e.into())),
            };

            let mut path = PathBuf::from(entry.file_name());
            path.push("exe");

            // ENOENT in this case is not due to disappearing PIDs, but rather
            // PIDs being kernel threads, which don't have a corresponding
            // executable.
            let target = match self.dir.read_link_contents(&path) {
                Ok(c) => c,
                Err(e)
                    if e.kind() == io::ErrorKind::NotFound
                        || e.kind() == io::ErrorKind::PermissionDenied =>
                {
                    continue
                }
                Err(e) => return Some(Err(e)),
            };

            let Some(file_name) = target.file_name() else {
                continue;
            };

            return Some(Ok((pidfd, file_name.to_owned())));
        }

        None
    }
}

/// Find running processes whose executable base name matches `name`.
pub fn find_process_by_name(name: &str) -> io::Result<Vec<OwnedFd>> {
    let mut fds = vec![];
    for entry in ProcessIter::new()? {
        let (pidfd, exe) = entry?;
        if exe.to_str() == Some(name) {
            fds.push(pidfd);
        }
    }
    Ok(fds)
}

/// Send SIGSTOP to a process when constructed and SIGCONT when dropped.
pub struct ProcessStopper(OwnedFd);

impl ProcessStopper {
    pub fn new(pidfd: OwnedFd) -> Result<Self, Errno> {
        let result = Self(pidfd);
        result.stop()?;
        Ok(result)
    }

    pub fn stop(&self) -> Result<(), Errno> {
        debug!("Sending SIGSTOP to {:?}", self.0);
        pidfd_send_signal(&self.0, Signal::STOP)
    }

    pub fn cont(&self) -> Result<(), Errno> {
        debug!("Sending SIGCONT to {:?}", self.0);
        pidfd_send_signal(&self.0, Signal::CONT)
    }
}

impl Drop for ProcessStopper {
    fn drop(&mut self) {
        let _ = self.cont();
    }
}

/// Parse `/proc/cmdline` into its whitespace-separated tokens, without
/// requiring `key=value` shape (some tokens are bare flags).
pub fn read_cmdline() -> Result<Vec<String>> {
    let data = fs::read_to_string("/proc/cmdline").context("Failed to read /proc/cmdline")?;
    Ok(data.split_whitespace().map(str::to_owned).collect())
}

/// Find the value of a `key=value` token in the kernel command line.
pub fn cmdline_value(tokens: &[String], key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    tokens
        .iter()
        .find_map(|t| t.strip_prefix(prefix.as_str()).map(str::to_owned))
}

/// The `usb_moded_ip=<client>:<server>:<gw>:<mask>:<host>:<dev>:<auto>` token
/// (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbModedIpConfig {
    pub client: String,
    pub server: String,
    pub gateway: String,
    pub mask: String,
    pub host: String,
    pub dev: String,
    pub auto: String,
}

pub fn parse_usb_moded_ip(value: &str) -> Option<UsbModedIpConfig> {
    let mut parts = value.splitn(7, ':');
    Some(UsbModedIpConfig {
        client: parts.next()?.to_owned(),
        server: parts.next()?.to_owned(),
        gateway: parts.next()?.to_owned(),
        mask: parts.next()?.to_owned(),
        host: parts.next()?.to_owned(),
        dev: parts.next()?.to_owned(),
        auto: parts.next().unwrap_or_default().to_owned(),
    })
}

/// An auto-expiring wake-lock, acquired for the duration of udev processing
/// or a mode transition (spec §5 "Wake-locks"). Writes the lock name to
/// `/sys/power/wake_lock` on acquire/renew and `/sys/power/wake_unlock` only
/// on explicit release, matching the "never released synchronously after one
/// operation except on clean shutdown" rule.
pub struct WakeLock {
    name: &'static str,
    held: AtomicBool,
}

impl WakeLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            held: AtomicBool::new(false),
        }
    }

    /// Acquire (or renew) the lock with a generous auto-expiry so a missed
    /// release doesn't pin the device awake forever.
    pub fn renew(&self, timeout: Duration) {
        self.held.store(true, Ordering::SeqCst);
        let line = format!("{} {}\n", self.name, timeout.as_nanos());
        if let Err(e) = fs::write("/sys/power/wake_lock", line) {
            warn!("Failed to acquire wake lock {:?}: {e}", self.name);
        } else {
            debug!("Renewed wake lock {:?} for {:?}", self.name, timeout);
        }
    }

    pub fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            if let Err(e) = fs::write("/sys/power/wake_unlock", format!("{}\n", self.name)) {
                warn!("Failed to release wake lock {:?}: {e}", self.name);
            }
        }
    }
}

/// The outcome of a cancellable wait (spec §4.H "wait(total_ms, ready_fn,
/// arg)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// Poll `ready_fn` every `tick` up to `total` duration, bailing out early if
/// `cancelled` becomes true. This is the single primitive behind every
/// blocking step the worker performs (mtpd readiness, module unload
/// settling, unmount retries).
pub fn cancellable_wait(
    total: Duration,
    tick: Duration,
    cancelled: &AtomicBool,
    mut ready_fn: impl FnMut() -> bool,
) -> WaitOutcome {
    let deadline = Instant::now() + total;

    loop {
        if ready_fn() {
            return WaitOutcome::Ready;
        }
        if cancelled.load(Ordering::SeqCst) {
            return WaitOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(tick));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellable_wait_returns_ready_immediately() {
        let cancelled = AtomicBool::new(false);
        let outcome = cancellable_wait(
            Duration::from_millis(200),
            Duration::from_millis(10),
            &cancelled,
            || true,
        );
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[test]
    fn cancellable_wait_honors_cancellation_within_one_tick() {
        let cancelled = AtomicBool::new(true);
        let outcome = cancellable_wait(
            Duration::from_secs(5),
            Duration::from_millis(20),
            &cancelled,
            || false,
        );
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[test]
    fn cancellable_wait_times_out() {
        let cancelled = AtomicBool::new(false);
        let outcome = cancellable_wait(
            Duration::from_millis(50),
            Duration::from_millis(10),
            &cancelled,
            || false,
        );
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn cmdline_value_extracts_token() {
        let tokens = vec![
            "androidboot.serialno=ABC123".to_owned(),
            "usb_moded_ip=1.2.3.4:5.6.7.8:1.1.1.1:255.255.255.0:host:usb0:0".to_owned(),
        ];
        assert_eq!(
            cmdline_value(&tokens, "androidboot.serialno"),
            Some("ABC123".to_owned())
        );
        let ip = parse_usb_moded_ip(&cmdline_value(&tokens, "usb_moded_ip").unwrap()).unwrap();
        assert_eq!(ip.client, "1.2.3.4");
        assert_eq!(ip.dev, "usb0");
    }
}
