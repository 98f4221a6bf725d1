// SPDX-License-Identifier: GPL-3.0-only

//! Cable state tracking (spec §4.F): fuses uevents from the `power_supply`,
//! `extcon`, and (legacy) `android_usb` subsystems into a single
//! [`CableState`], with debouncing so a flaky connector doesn't cause mode
//! thrashing.
//!
//! The uevent monitor is a raw `AF_NETLINK`/`NETLINK_KOBJECT_UEVENT` socket
//! rather than a `udev` crate dependency, following the same low-level
//! netlink pattern `nusb`'s Linux hotplug backend uses for USB device
//! arrival/removal notifications.

use std::{
    collections::BTreeMap,
    ffi::CString,
    io,
    mem::MaybeUninit,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::state::CableState;

/// Minimum time a raw reading must hold before it's accepted as the new
/// stable state (spec §4.F "Debounce").
const MIN_DEBOUNCE: Duration = Duration::from_millis(100);
/// Upper bound on debounce even if the caller asks for more (spec §4.F).
const MAX_DEBOUNCE: Duration = Duration::from_secs(4);

fn debounce_window(requested: Option<Duration>) -> Duration {
    requested
        .unwrap_or(MIN_DEBOUNCE)
        .clamp(MIN_DEBOUNCE, MAX_DEBOUNCE)
}

/// One parsed uevent: the action line plus its `KEY=VALUE` environment.
#[derive(Debug, Clone, Default)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub properties: BTreeMap<String, String>,
}

impl Uevent {
    fn parse(buf: &[u8]) -> Option<Self> {
        let mut chunks = buf.split(|&b| b == 0).filter(|c| !c.is_empty());

        let header = chunks.next()?;
        let header = std::str::from_utf8(header).ok()?;
        let (action, devpath) = header.split_once('@')?;

        let mut properties = BTreeMap::new();
        for chunk in chunks {
            let Ok(s) = std::str::from_utf8(chunk) else {
                continue;
            };
            if let Some((k, v)) = s.split_once('=') {
                properties.insert(k.to_owned(), v.to_owned());
            }
        }

        Some(Self {
            action: action.to_owned(),
            devpath: devpath.to_owned(),
            properties,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// A raw `NETLINK_KOBJECT_UEVENT` socket, joined to the kernel's single
/// multicast group. No `bind()` address filtering is possible beyond the
/// group mask, so every kobject uevent on the system arrives here and is
/// filtered in [`classify`].
pub struct UeventSocket {
    fd: OwnedFd,
}

impl UeventSocket {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2)/bind(2) calls with a stack-local sockaddr_nl;
        // no pointers escape this function.
        unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0;
            // Group 1 is the kernel's single kobject-uevent multicast group.
            addr.nl_groups = 1;

            let ret = libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            );
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self { fd })
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Receive one datagram. Returns `Ok(None)` on `EAGAIN` (socket is
    /// non-blocking; the caller is expected to have polled readability
    /// first).
    pub fn recv(&self) -> io::Result<Option<Uevent>> {
        let mut buf = [MaybeUninit::<u8>::uninit(); 8192];
        // SAFETY: recv() only ever initializes the first `n` bytes it returns.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr().cast(), n as usize) };
        Ok(Uevent::parse(bytes))
    }
}

/// Score a `power_supply` uevent's properties into a cable state. `None`
/// means "not informative" (wrong subsystem, or missing the fields we need).
fn classify_power_supply(props: &BTreeMap<String, String>) -> Option<CableState> {
    let online = props.get("POWER_SUPPLY_ONLINE").map(String::as_str);
    if online == Some("0") {
        return Some(CableState::Disconnected);
    }
    if online != Some("1") {
        return None;
    }

    let kind = props
        .get("POWER_SUPPLY_USB_TYPE")
        .or_else(|| props.get("POWER_SUPPLY_TYPE"))
        .map(String::as_str)
        .unwrap_or("");

    match kind {
        // Data-capable: negotiated with a host controller, or explicitly a PD
        // contract (which implies a capable port on the other end).
        "USB" | "USB_CDP" | "USB_PD" | "USB_PD_DRP" => Some(CableState::PcConnected),
        // Dedicated-charger shapes: no data negotiation happened.
        "USB_DCP" | "USB_ACA" | "USB_FLOAT" | "Mains" | "Wireless" => {
            Some(CableState::ChargerConnected)
        }
        // Unrecognized type strings with online=1 are common on OEM kernels;
        // treat as a charger rather than silently dropping the event, since
        // we know at least that *something* is attached.
        _ => Some(CableState::ChargerConnected),
    }
}

fn classify_extcon(props: &BTreeMap<String, String>) -> Option<CableState> {
    let state = props.get("STATE")?;
    if state.contains("USB-HOST=1") || state.contains("USB_HOST=1") {
        Some(CableState::PcConnected)
    } else if state.contains("USB=1") || state.contains("SDP=1") {
        Some(CableState::PcConnected)
    } else if state.contains("TA=1") || state.contains("USB_DCP=1") {
        Some(CableState::ChargerConnected)
    } else if state.ends_with("=0") || state.is_empty() {
        Some(CableState::Disconnected)
    } else {
        None
    }
}

fn classify_android_usb(props: &BTreeMap<String, String>) -> Option<CableState> {
    match props.get("USB_STATE").map(String::as_str) {
        Some("CONFIGURED") | Some("CONNECTED") => Some(CableState::PcConnected),
        Some("DISCONNECTED") => Some(CableState::Disconnected),
        _ => None,
    }
}

/// Classify a single uevent, regardless of which subsystem it came from.
pub fn classify(event: &Uevent) -> Option<CableState> {
    match event.get("SUBSYSTEM") {
        Some("power_supply") => classify_power_supply(&event.properties),
        Some("extcon") => classify_extcon(&event.properties),
        Some("android_usb") => classify_android_usb(&event.properties),
        _ => None,
    }
}

/// Best-effort synchronous scan of `/sys/class/power_supply/*/uevent`, used
/// to seed the initial cable state before any uevent has arrived (spec §4.F
/// "Startup").
pub fn scan_power_supplies(root: &Path) -> CableState {
    let Ok(entries) = std::fs::read_dir(root) else {
        return CableState::Unknown;
    };

    let mut best = CableState::Unknown;

    for entry in entries.flatten() {
        let uevent_path = entry.path().join("uevent");
        let Ok(contents) = std::fs::read_to_string(&uevent_path) else {
            continue;
        };

        let props: BTreeMap<String, String> = contents
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();

        if let Some(state) = classify_power_supply(&props) {
            // A PC connection is the most specific signal; prefer it over a
            // plain charger reading from a different supply node.
            if state == CableState::PcConnected || best == CableState::Unknown {
                best = state;
            }
        }
    }

    best
}

/// Debounced fusion of cable-state observations (spec §4.F).
pub struct CableTracker {
    window: Duration,
    raw: CableState,
    stable: CableState,
    last_change: Instant,
    pending_since: Option<Instant>,
}

impl CableTracker {
    pub fn new(initial: CableState, max_cable_delay: Option<Duration>) -> Self {
        Self {
            window: debounce_window(max_cable_delay),
            raw: initial,
            stable: initial,
            last_change: Instant::now(),
            pending_since: None,
        }
    }

    pub fn stable(&self) -> CableState {
        self.stable
    }

    /// Feed one observation in. Returns `true` if this call started a new
    /// debounce window (the raw reading just changed).
    pub fn observe(&mut self, state: CableState) -> bool {
        if state == self.raw {
            return false;
        }
        trace!("Cable raw observation changed: {:?} -> {:?}", self.raw, state);
        self.raw = state;
        self.pending_since = Some(Instant::now());
        true
    }

    /// Called periodically (or right after [`observe`]) to check whether the
    /// debounce window has elapsed. Returns `Some(new_stable_state)` exactly
    /// once per accepted transition.
    pub fn tick(&mut self) -> Option<CableState> {
        let since = self.pending_since?;
        if since.elapsed() < self.window {
            return None;
        }

        self.pending_since = None;
        if self.raw == self.stable {
            return None;
        }

        debug!("Cable state settled: {:?} -> {:?}", self.stable, self.raw);
        self.stable = self.raw;
        self.last_change = Instant::now();
        Some(self.stable)
    }

    /// How long until the current debounce window would fire, for use as a
    /// poll timeout by the caller's event loop.
    pub fn next_deadline(&self) -> Option<Duration> {
        let since = self.pending_since?;
        Some(self.window.saturating_sub(since.elapsed()))
    }

    pub fn time_since_last_change(&self) -> Duration {
        self.last_change.elapsed()
    }
}

/// Whether a stable-state transition should also raise the legacy
/// connect/disconnect broadcast (spec §6 "legacy events"): any transition
/// into or out of [`CableState::Disconnected`], independent of mode changes.
pub fn legacy_event_for_transition(from: CableState, to: CableState) -> Option<&'static str> {
    use CableState::{ChargerConnected, Disconnected, PcConnected, Unknown};

    match (from, to) {
        (Disconnected, PcConnected | ChargerConnected) => Some("usb_connected"),
        (PcConnected | ChargerConnected, Disconnected) => Some("usb_disconnected"),
        (Unknown, PcConnected | ChargerConnected) => Some("usb_connected"),
        _ => None,
    }
}

/// Build a `CString` devpath, retained only for potential future filtering;
/// kept as a standalone helper so `Uevent::parse` stays allocation-light.
#[allow(dead_code)]
fn devpath_cstring(path: &str) -> Option<CString> {
    CString::new(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_power_supply_online_usb_is_pc_connected() {
        let props = BTreeMap::from([
            ("POWER_SUPPLY_ONLINE".to_owned(), "1".to_owned()),
            ("POWER_SUPPLY_TYPE".to_owned(), "USB".to_owned()),
        ]);
        assert_eq!(classify_power_supply(&props), Some(CableState::PcConnected));
    }

    #[test]
    fn classify_power_supply_dcp_is_charger() {
        let props = BTreeMap::from([
            ("POWER_SUPPLY_ONLINE".to_owned(), "1".to_owned()),
            ("POWER_SUPPLY_TYPE".to_owned(), "USB_DCP".to_owned()),
        ]);
        assert_eq!(
            classify_power_supply(&props),
            Some(CableState::ChargerConnected)
        );
    }

    #[test]
    fn classify_power_supply_offline_is_disconnected() {
        let props = BTreeMap::from([("POWER_SUPPLY_ONLINE".to_owned(), "0".to_owned())]);
        assert_eq!(
            classify_power_supply(&props),
            Some(CableState::Disconnected)
        );
    }

    #[test]
    fn uevent_parse_splits_action_and_properties() {
        let raw = b"change@/devices/foo\0ACTION=change\0SUBSYSTEM=power_supply\0POWER_SUPPLY_ONLINE=1\0";
        let event = Uevent::parse(raw).unwrap();
        assert_eq!(event.action, "change");
        assert_eq!(event.devpath, "/devices/foo");
        assert_eq!(event.get("SUBSYSTEM"), Some("power_supply"));
    }

    #[test]
    fn tracker_requires_debounce_window_to_elapse() {
        let mut tracker = CableTracker::new(
            CableState::Disconnected,
            Some(Duration::from_millis(50)),
        );
        assert!(tracker.observe(CableState::PcConnected));
        assert_eq!(tracker.tick(), None);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(tracker.tick(), Some(CableState::PcConnected));
        assert_eq!(tracker.stable(), CableState::PcConnected);
    }

    #[test]
    fn tracker_clamps_window_to_bounds() {
        let tracker = CableTracker::new(CableState::Unknown, Some(Duration::from_secs(60)));
        assert_eq!(tracker.window, MAX_DEBOUNCE);
        let tracker = CableTracker::new(CableState::Unknown, Some(Duration::from_millis(1)));
        assert_eq!(tracker.window, MIN_DEBOUNCE);
    }

    #[test]
    fn legacy_event_fires_only_across_disconnected_boundary() {
        assert_eq!(
            legacy_event_for_transition(CableState::Disconnected, CableState::PcConnected),
            Some("usb_connected")
        );
        assert_eq!(
            legacy_event_for_transition(CableState::PcConnected, CableState::ChargerConnected),
            None
        );
        assert_eq!(
            legacy_event_for_transition(CableState::ChargerConnected, CableState::Disconnected),
            Some("usb_disconnected")
        );
    }
}
