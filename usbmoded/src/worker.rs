// SPDX-License-Identifier: GPL-3.0-only

//! The worker thread (spec §4.H): the only thread allowed to actuate the USB
//! gadget. The main thread hands it one `TransitionRequest` at a time
//! through a mutex-guarded slot and wakes it via a self-pipe; the worker
//! reports completion back the same way so the main thread's poll loop
//! notices without a busy-wait.

use std::{
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::appsync::AppSync;
use crate::backend::{ApplyRequest, BackendKind};
use crate::state::{internal_mode, ModeDescriptor, ModeName, WorkerOwnedState};
use crate::util::{cancellable_wait, WaitOutcome, WakeLock};

static TRANSITION_LOCK: WakeLock = WakeLock::new("usb_moded_transition");

const MTPD_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const MTPD_SETTLE_TICK: Duration = Duration::from_millis(100);
const MTPD_PROCESS_NAME: &str = "mtp-server";

/// What the engine asks the worker to actuate. Carries everything needed to
/// program the gadget without the worker reaching back into main-thread
/// state (spec §3 "Ownership").
pub struct TransitionRequest {
    pub hw_mode: ModeName,
    pub descriptor: Option<ModeDescriptor>,
    /// The externally-visible mode name, used only for the appsync/broadcast
    /// callback, not for actuation decisions.
    pub external_name: ModeName,
}

/// What actually happened, reported back to the main thread's completion
/// watcher (spec §4.H "Completion notification", §7 failure broadcast).
#[derive(Debug, Clone)]
pub struct TransitionResult {
    /// The hw mode actually programmed once the attempt settled: either
    /// `req.hw_mode` on success, `charging_only` if actuation failed but the
    /// charging-only fallback succeeded, or `undefined` if even that failed.
    pub activated_hw_mode: ModeName,
    /// The externally-visible name to broadcast on success; ignored when
    /// `failed` is set, since `activated_hw_mode` already names the right
    /// fallback mode in that case.
    pub external_name: ModeName,
    pub failed: bool,
}

enum Job {
    Transition(TransitionRequest),
    Shutdown,
}

struct Shared {
    slot: Mutex<Option<Job>>,
    bailout_requested: AtomicBool,
    bailout_handled: AtomicBool,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    last_result: Mutex<Option<TransitionResult>>,
}

impl Shared {
    fn wake(&self) {
        let buf = [0u8];
        let _ = rustix::io::write(&self.wake_write, &buf);
    }

    fn wait_for_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match rustix::io::read(&self.wake_read, &mut buf) {
                Ok(0) => continue,
                Ok(_) => return,
                Err(rustix::io::Errno::INTR) => continue,
                Err(_) => return,
            }
        }
    }
}

/// Handle the main thread keeps; the worker thread owns the other end of
/// everything through `Arc<Shared>`.
pub struct WorkerHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread. Returns the handle and a read fd the caller
    /// should add to its poll set: one byte arrives on it whenever a
    /// transition completes (spec §4.H "Completion notification").
    pub fn spawn(backend: BackendKind, appsync: AppSync) -> Result<(Self, OwnedFd)> {
        let (wake_read, wake_write) = rustix::pipe::pipe()?;
        let (completion_read, completion_write) = rustix::pipe::pipe()?;

        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            bailout_requested: AtomicBool::new(false),
            bailout_handled: AtomicBool::new(false),
            wake_read,
            wake_write,
            last_result: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("usb-moded-worker".into())
            .spawn(move || worker_main(thread_shared, backend, appsync, completion_write))?;

        Ok((
            Self {
                shared,
                join: Some(join),
            },
            completion_read,
        ))
    }

    /// Submit a transition. Returns `false` (and does nothing) if the worker
    /// is still busy with a previous one — the caller should broadcast the
    /// `busy` internal mode in that case (spec §4.G).
    pub fn submit(&self, req: TransitionRequest) -> bool {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Job::Transition(req));
        drop(slot);
        self.shared.wake();
        true
    }

    pub fn is_busy(&self) -> bool {
        self.shared.slot.lock().unwrap().is_some()
    }

    /// Take whatever the worker last reported, if anything arrived since the
    /// last call (spec §4.H "Completion notification").
    pub fn take_last_result(&self) -> Option<TransitionResult> {
        self.shared.last_result.lock().unwrap().take()
    }

    /// Ask whatever transition is in progress to bail out at its next
    /// cancellation point (spec §4.H "Cancellation"). Non-blocking; the
    /// worker acknowledges by clearing `bailout_requested` once it notices.
    pub fn cancel_current(&self) {
        self.shared.bailout_requested.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    pub fn shutdown(mut self) {
        {
            let mut slot = self.shared.slot.lock().unwrap();
            *slot = Some(Job::Shutdown);
        }
        self.shared.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>, backend: BackendKind, appsync: AppSync, completion_write: OwnedFd) {
    let mut owned = WorkerOwnedState::new();

    loop {
        shared.wait_for_wake();

        let job = shared.slot.lock().unwrap().take();
        match job {
            None => continue,
            Some(Job::Shutdown) => {
                info!("Worker thread shutting down");
                TRANSITION_LOCK.release();
                break;
            }
            Some(Job::Transition(req)) => {
                shared.bailout_requested.store(false, Ordering::SeqCst);
                shared.bailout_handled.store(false, Ordering::SeqCst);

                let result = run_transition(&backend, &appsync, &mut owned, req, &shared.bailout_requested);
                *shared.last_result.lock().unwrap() = Some(result);

                shared.bailout_handled.store(true, Ordering::SeqCst);
                let _ = rustix::io::write(&completion_write, &[0u8]);
            }
        }
    }
}

/// Actuate one `TransitionRequest`, short-circuiting when the hardware is
/// already in the requested mode, and falling back to plain charging (then
/// to `undefined`) if actuation fails (spec §4.H step 4, §7).
fn run_transition(
    backend: &BackendKind,
    appsync: &AppSync,
    owned: &mut WorkerOwnedState,
    req: TransitionRequest,
    bailout: &AtomicBool,
) -> TransitionResult {
    let external_name = req.external_name.clone();

    if req.hw_mode == owned.activated_hw_mode {
        debug!("Hardware already in {}, skipping actuation", req.hw_mode);
        return TransitionResult {
            activated_hw_mode: owned.activated_hw_mode.clone(),
            external_name,
            failed: false,
        };
    }

    let hw_mode = req.hw_mode.clone();

    if let Err(e) = attempt_transition(backend, appsync, owned, req, bailout) {
        error!("Mode transition to {hw_mode} failed: {e:#}; falling back to charging");

        let fallback = TransitionRequest {
            hw_mode: internal_mode::CHARGING_ONLY.to_owned(),
            descriptor: None,
            external_name: internal_mode::CHARGING_ONLY.to_owned(),
        };

        return match attempt_transition(backend, appsync, owned, fallback, bailout) {
            Ok(()) => TransitionResult {
                activated_hw_mode: internal_mode::CHARGING_ONLY.to_owned(),
                external_name,
                failed: true,
            },
            Err(e2) => {
                error!("Charging fallback also failed: {e2:#}");
                owned.activated_hw_mode = internal_mode::UNDEFINED.to_owned();
                owned.active_descriptor = None;
                TransitionResult {
                    activated_hw_mode: internal_mode::UNDEFINED.to_owned(),
                    external_name,
                    failed: true,
                }
            }
        };
    }

    TransitionResult {
        activated_hw_mode: owned.activated_hw_mode.clone(),
        external_name,
        failed: false,
    }
}

/// The actual transition sequence (spec §4.H "Transition steps"): deactivate
/// appsync for the outgoing mode, reprogram the gadget, then activate
/// appsync for the incoming one. Mass-storage-bearing backends need the MTP
/// daemon stopped before the gadget function changes and restarted after, so
/// that order is inserted only when the outgoing or incoming mode isn't
/// mass-storage-shaped.
fn attempt_transition(
    backend: &BackendKind,
    appsync: &AppSync,
    owned: &mut WorkerOwnedState,
    req: TransitionRequest,
    bailout: &AtomicBool,
) -> Result<()> {
    TRANSITION_LOCK.renew(Duration::from_secs(10));

    let backend = backend.as_backend();
    let needs_mtpd_pause = owned
        .active_descriptor
        .as_ref()
        .map(|d| !d.mass_storage)
        .unwrap_or(false)
        || req.descriptor.as_ref().map(|d| !d.mass_storage).unwrap_or(false);

    appsync.deactivate(false)?;

    let stopper = if needs_mtpd_pause {
        match crate::util::find_process_by_name(MTPD_PROCESS_NAME) {
            Ok(fds) => fds
                .into_iter()
                .filter_map(|fd| crate::util::ProcessStopper::new(fd).ok())
                .collect::<Vec<_>>(),
            Err(e) => {
                debug!("Could not enumerate {MTPD_PROCESS_NAME} processes: {e}");
                vec![]
            }
        }
    } else {
        vec![]
    };

    let apply_request = ApplyRequest::for_mode(&req.hw_mode, req.descriptor.as_ref());
    backend.apply(&apply_request)?;

    if let Some(descriptor) = &req.descriptor {
        configure_network(descriptor, bailout)?;
    }

    drop(stopper);

    if cancellable_wait(
        MTPD_SETTLE_TIMEOUT,
        MTPD_SETTLE_TICK,
        bailout,
        || !needs_mtpd_pause,
    ) == WaitOutcome::Cancelled
    {
        warn!("Transition to {} cancelled mid-flight", req.hw_mode);
        return Ok(());
    }

    owned.activated_hw_mode = req.hw_mode.clone();
    owned.active_descriptor = req.descriptor.clone();
    owned.tracked_writes = backend.current_functions().unwrap_or_default();

    appsync.activate_pre(req.descriptor.as_ref())?;
    appsync.mark_active(&req.external_name, appsync.activate_post(req.descriptor.as_ref())?);

    Ok(())
}

/// Stand up (or tear down) the per-mode network stack: udhcpd, NAT, and
/// connman tethering toggling (spec supplement: dropped-feature B.5).
fn configure_network(descriptor: &ModeDescriptor, bailout: &AtomicBool) -> Result<()> {
    if !descriptor.network {
        teardown_network()?;
        return Ok(());
    }

    let Some(iface) = &descriptor.network_interface else {
        warn!("Mode {} requests networking but has no network_interface", descriptor.mode_name);
        return Ok(());
    };

    if descriptor.dhcp_server {
        write_udhcpd_conf(iface)?;
        restart_udhcpd(iface, bailout)?;
    }

    if descriptor.nat {
        enable_nat(iface)?;
    }

    if let Some(tech) = &descriptor.connman_tethering {
        set_connman_tethering(tech, true);
    }

    Ok(())
}

fn teardown_network() -> Result<()> {
    for pidfd in crate::util::find_process_by_name("udhcpd").unwrap_or_default() {
        let _ = crate::util::pidfd_send_signal(&pidfd, rustix::process::Signal::TERM);
    }
    disable_nat();
    Ok(())
}

const UDHCPD_CONF_PATH: &str = "/var/run/usb-moded-udhcpd.conf";
const UDHCPD_CONF_SYMLINK: &str = "/etc/udhcpd.conf";

fn write_udhcpd_conf(iface: &str) -> Result<()> {
    let contents = format!(
        "start\t192.168.2.2\n\
         end\t192.168.2.20\n\
         interface\t{iface}\n\
         max_leases\t20\n\
         option\tsubnet\t255.255.255.0\n\
         option\tlease\t3600\n"
    );
    std::fs::write(UDHCPD_CONF_PATH, contents)?;

    let _ = std::fs::remove_file(UDHCPD_CONF_SYMLINK);
    std::os::unix::fs::symlink(UDHCPD_CONF_PATH, UDHCPD_CONF_SYMLINK)?;
    Ok(())
}

fn restart_udhcpd(iface: &str, bailout: &AtomicBool) -> Result<()> {
    for pidfd in crate::util::find_process_by_name("udhcpd").unwrap_or_default() {
        let _ = crate::util::pidfd_send_signal(&pidfd, rustix::process::Signal::TERM);
    }

    cancellable_wait(Duration::from_secs(1), Duration::from_millis(50), bailout, || {
        crate::util::find_process_by_name("udhcpd").unwrap_or_default().is_empty()
    });

    std::process::Command::new("udhcpd")
        .arg(UDHCPD_CONF_PATH)
        .arg("-S")
        .arg("-I")
        .arg(iface)
        .spawn()?;

    Ok(())
}

fn enable_nat(iface: &str) -> Result<()> {
    let _ = std::process::Command::new("iptables")
        .args(["-t", "nat", "-A", "POSTROUTING", "-o", iface, "-j", "MASQUERADE"])
        .status();
    Ok(())
}

fn disable_nat() {
    let _ = std::process::Command::new("iptables")
        .args(["-t", "nat", "-F", "POSTROUTING"])
        .status();
}

fn set_connman_tethering(technology: &str, enable: bool) {
    let action = if enable { "true" } else { "false" };
    let _ = std::process::Command::new("connmanctl")
        .args(["tether", technology, action])
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_request_carries_hardware_and_external_names() {
        let req = TransitionRequest {
            hw_mode: internal_mode::CHARGING_ONLY.to_owned(),
            descriptor: None,
            external_name: internal_mode::CHARGING_ONLY.to_owned(),
        };
        assert_eq!(req.hw_mode, internal_mode::CHARGING_ONLY);
    }
}
