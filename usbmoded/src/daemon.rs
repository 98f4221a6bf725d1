// SPDX-License-Identifier: GPL-3.0-only

//! The long-running daemon (spec §4): wires the cable tracker, settings
//! store, mode catalog, selection engine, and worker thread together, and
//! serves the RPC socket. Three kinds of threads run concurrently — the
//! cable-monitor thread (owns the netlink socket and the engine), the
//! worker thread (the only one allowed to touch the gadget, see
//! `worker.rs`), and one thread per connected RPC client (mirroring the
//! teacher's `thread::scope` accept loop) — all synchronized through a
//! single `Mutex<ControlState>`.

use std::{
    fs, io,
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::{fs::FileTypeExt, net::UnixListener, net::UnixStream},
    },
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use byteorder::{ReadBytesExt, WriteBytesExt};
use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal as NixSignal};
use tracing::{debug, error, info, info_span, warn};

use crate::{
    appsync::AppSync,
    backend::BackendKind,
    cable::{self, CableTracker, UeventSocket},
    catalog::Catalog,
    engine::{self, DecisionInputs, EngineEvent},
    message::{self, FromSocket, ToSocket},
    rpc::{self, Request, Response},
    settings::Settings,
    state::{internal_mode, map_to_external, map_to_hardware, CableState, ControlState},
    worker::{self, TransitionRequest, WorkerHandle},
};

// Defaults for a mainline Linux configfs gadget; override via CLI flags on
// devices whose gadget driver lives elsewhere.
const CONFIGFS_GADGET_ROOT: &str = "/sys/kernel/config/usb_gadget/g1";
const ANDROID_USB_ROOT: &str = "/sys/class/android_usb/android0";
const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Flag file systemd drops once early bootup has settled (spec §4.G step
/// 5). Absent outside systemd-managed systems, in which case the gate never
/// opens on its own and stays at whatever `--init-done` plumbing forces.
const INIT_DONE_FLAG_PATH: &str = "/run/systemd/boot-status/init-done";

fn probe_init_done() -> bool {
    std::path::Path::new(INIT_DONE_FLAG_PATH).exists()
}

/// Run the daemon.
#[derive(Debug, Parser)]
pub struct DaemonCli {
    /// Force charging-only mode and ignore the mode catalog.
    #[arg(long)]
    pub fallback: bool,

    /// Start directly in diagnostic (factory test) mode.
    #[arg(long)]
    pub diag: bool,

    /// Start in rescue mode for this session.
    #[arg(long)]
    pub rescue: bool,

    /// Maximum cable-state debounce delay, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub max_cable_delay: Option<u64>,

    /// Notify systemd (`sd_notify READY=1`) once startup finishes.
    #[arg(long)]
    pub systemd: bool,

    /// Directory of static `*.ini` configuration fragments.
    #[arg(long, default_value = "/etc/usb-moded", value_name = "DIR")]
    pub config_dir: PathBuf,

    /// Path to the writable configuration overlay.
    #[arg(
        long,
        default_value = "/var/lib/usb-moded/usb-moded.ini",
        value_name = "FILE"
    )]
    pub overlay_file: PathBuf,

    /// Directory of mode descriptor `*.ini` files.
    #[arg(long, default_value = "/usr/share/usb-moded/modes", value_name = "DIR")]
    pub mode_dir: PathBuf,

    /// Directory containing the single diagnostic mode descriptor.
    #[arg(
        long,
        default_value = "/usr/share/usb-moded/modes-diag",
        value_name = "DIR"
    )]
    pub diag_mode_dir: PathBuf,
}

/// Everything shared between the RPC handler threads and the cable-monitor
/// thread (spec §3 "Ownership": only the worker thread touches hardware
/// directly; everything else funnels through this lock).
struct Shared {
    control: Mutex<ControlState>,
    settings: Mutex<Settings>,
    catalog: Mutex<Catalog>,
    diag_mode: Option<String>,
    worker: WorkerHandle,
    subscribers: Mutex<Vec<UnixStream>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn broadcast(&self, signal: rpc::Signal) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain_mut(|stream| signal.to_socket(stream).is_ok());
    }

    /// Apply the events produced by a call to `engine::decide`: broadcast
    /// what changed, then (if the target changed) hand the worker a new
    /// transition built from the freshly-resolved hardware mode.
    fn apply_decision(&self, state: &mut ControlState, events: Vec<EngineEvent>, target: &str) {
        let mut target_changed = false;

        for event in &events {
            match event {
                EngineEvent::TargetChanged { from, to } => {
                    target_changed = true;
                    info!("Target mode: {from} -> {to}");
                    self.broadcast(rpc::Signal::TargetState(rpc::TargetStateSignal {
                        mode: map_to_external(to),
                    }));
                }
                EngineEvent::SelectedModeChanged(mode) => {
                    debug!("Resolved dynamic mode: {mode}");
                }
                EngineEvent::PendingUserChange(pending) => {
                    debug!("ask-gate pending: {pending}");
                }
            }
        }

        if !target_changed {
            return;
        }

        let hw_mode = map_to_hardware(target);
        let descriptor = self.catalog.lock().unwrap().get(&hw_mode).cloned();

        let submitted = self.worker.submit(TransitionRequest {
            hw_mode,
            descriptor,
            external_name: map_to_external(target),
        });

        if submitted {
            // Exit from busy is always accompanied by a fresh current-state
            // broadcast once the worker reports completion
            // (`worker_completion_thread`); mirror that on entry too.
            state.external = internal_mode::BUSY.to_owned();
            self.broadcast(rpc::Signal::CurrentState(rpc::CurrentStateSignal {
                mode: internal_mode::BUSY.to_owned(),
            }));
        } else {
            warn!("Worker busy; deferring transition to {target}");
            self.broadcast(rpc::Signal::TargetState(rpc::TargetStateSignal {
                mode: internal_mode::BUSY.to_owned(),
            }));
        }
    }

    fn redecide(&self, state: &mut ControlState) {
        let catalog = self.catalog.lock().unwrap();
        let events = engine::decide(
            state,
            DecisionInputs {
                settings: &mut self.settings.lock().unwrap(),
                catalog: &catalog,
                diag_mode: self.diag_mode.as_deref(),
            },
        );
        let target = state.target.clone();
        drop(catalog);
        self.apply_decision(state, events, &target);
    }
}

// --- Self-pipe signal handling ---------------------------------------------

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [signum as u8];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Install a self-pipe (spec §4.H "async-signal-safe shutdown"): the actual
/// signal handler only writes one byte, and a dedicated thread blocks
/// reading the other end, converting the signal into ordinary control flow.
fn install_signal_pipe() -> Result<OwnedFd> {
    let (read_fd, write_fd) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
        .context("Failed to create signal self-pipe")?;

    SIGNAL_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::SeqCst);
    std::mem::forget(write_fd);

    unsafe {
        signal::signal(NixSignal::SIGTERM, SigHandler::Handler(signal_handler))
            .context("Failed to install SIGTERM handler")?;
        signal::signal(NixSignal::SIGHUP, SigHandler::Handler(signal_handler))
            .context("Failed to install SIGHUP handler")?;
        signal::signal(NixSignal::SIGINT, SigHandler::Handler(signal_handler))
            .context("Failed to install SIGINT handler")?;
    }

    Ok(read_fd)
}

/// Notify systemd that startup is complete, if `NOTIFY_SOCKET` is set (spec
/// supplement: dropped-feature B, systemd integration).
fn sd_notify_ready() {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };

    let addr = match path.strip_prefix('@') {
        Some(abstract_name) => format!("\0{abstract_name}"),
        None => path,
    };

    if let Ok(stream) = std::os::unix::net::UnixDatagram::unbound() {
        let _ = stream.send_to(b"READY=1\n", addr.as_bytes());
    }
}

fn remove_stale_socket() {
    if let Ok(meta) = fs::symlink_metadata(rpc::SOCKET_PATH) {
        if meta.file_type().is_socket() {
            let _ = fs::remove_file(rpc::SOCKET_PATH);
        }
    }
}

fn handle_rpc_connection(shared: &Arc<Shared>, mut stream: UnixStream, peer_uid: u32) -> Result<()> {
    let client_version = stream.read_u8().context("Failed to read protocol version")?;
    if client_version != message::PROTOCOL_VERSION {
        stream.write_u8(0)?;
        anyhow::bail!("Unsupported client protocol version: {client_version}");
    }
    stream.write_u8(1)?;

    if peer_uid != crate::state::UNKNOWN_UID {
        shared.control.lock().unwrap().current_user = peer_uid;
    }

    {
        let subscribed = stream.try_clone().context("Failed to clone stream for broadcast")?;
        shared.subscribers.lock().unwrap().push(subscribed);
    }

    loop {
        let request = match Request::from_socket(&mut stream) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => return Err(e).context("Failed to receive request"),
        };

        let response = dispatch_request(shared, &request, peer_uid);
        response
            .to_socket(&mut stream)
            .with_context(|| format!("Failed to send response: {response:?}"))?;
    }
}

fn dispatch_request(shared: &Shared, request: &Request, peer_uid: u32) -> Response {
    let result = (|| -> Result<Response> {
        match request {
            Request::GetTargetState(_) => {
                let state = shared.control.lock().unwrap();
                Ok(Response::GetTargetState(rpc::GetTargetStateResponse {
                    mode: map_to_external(&state.target),
                }))
            }
            Request::GetTargetConfig(_) => {
                let state = shared.control.lock().unwrap();
                let catalog = shared.catalog.lock().unwrap();
                let descriptor = catalog.get(&map_to_hardware(&state.target));
                Ok(Response::GetTargetConfig(rpc::GetTargetConfigResponse {
                    network: descriptor.map(|d| d.network).unwrap_or(false),
                    network_interface: descriptor
                        .and_then(|d| d.network_interface.clone())
                        .unwrap_or_default(),
                }))
            }
            Request::SetMode(r) => {
                let mut state = shared.control.lock().unwrap();
                {
                    let catalog = shared.catalog.lock().unwrap();
                    if !catalog.contains(&r.mode) && !crate::state::is_internal_mode(&r.mode) {
                        return Err(crate::error::DaemonError::Config(format!(
                            "no such mode: {}",
                            r.mode
                        ))
                        .into());
                    }
                }

                if state.cable != CableState::PcConnected {
                    return Err(crate::error::DaemonError::Config(
                        "cannot set mode unless a PC is connected".to_owned(),
                    )
                    .into());
                }

                if peer_uid != 0 {
                    let settings = shared.settings.lock().unwrap();
                    let hidden = settings.hidden_modes();
                    let whitelist = settings.whitelist();
                    let permitted = !hidden.iter().any(|h| h == &r.mode)
                        && (whitelist.is_empty() || whitelist.iter().any(|w| w == &r.mode));
                    drop(settings);
                    if !permitted {
                        return Err(crate::error::DaemonError::Permission(format!(
                            "uid {peer_uid} may not select mode {}",
                            r.mode
                        ))
                        .into());
                    }
                }

                if shared.worker.is_busy() {
                    return Err(crate::error::DaemonError::Busy.into());
                }

                state.user = peer_uid;
                engine::select_mode(&mut state, r.mode.clone());
                shared.redecide(&mut state);
                Ok(Response::SetMode(rpc::SetModeResponse))
            }
            Request::GetConfig(r) => {
                let settings = shared.settings.lock().unwrap();
                Ok(Response::GetConfig(rpc::GetConfigResponse {
                    value: settings.get_string(&r.group, &r.key).unwrap_or_default(),
                }))
            }
            Request::SetConfig(r) => {
                shared
                    .settings
                    .lock()
                    .unwrap()
                    .set(&r.group, &r.key, &r.value)?;
                shared.broadcast(rpc::Signal::ConfigChanged(rpc::ConfigChangedSignal));
                Ok(Response::SetConfig(rpc::SetConfigResponse))
            }
            Request::Hide(r) => {
                let mut settings = shared.settings.lock().unwrap();
                let hidden = crate::settings::list_add(&settings.hidden_modes(), &r.mode);
                settings.set_hidden(&hidden)?;
                drop(settings);
                shared.broadcast(rpc::Signal::HiddenModesChanged(rpc::HiddenModesChangedSignal {
                    modes: hidden,
                }));
                Ok(Response::Hide(rpc::HideResponse))
            }
            Request::Unhide(r) => {
                let mut settings = shared.settings.lock().unwrap();
                let hidden = crate::settings::list_remove(&settings.hidden_modes(), &r.mode);
                settings.set_hidden(&hidden)?;
                drop(settings);
                shared.broadcast(rpc::Signal::HiddenModesChanged(rpc::HiddenModesChangedSignal {
                    modes: hidden,
                }));
                Ok(Response::Unhide(rpc::UnhideResponse))
            }
            Request::GetHidden(_) => Ok(Response::GetHidden(rpc::GetHiddenResponse {
                modes: shared.settings.lock().unwrap().hidden_modes(),
            })),
            Request::GetWhitelist(_) => Ok(Response::GetWhitelist(rpc::GetWhitelistResponse {
                modes: shared.settings.lock().unwrap().whitelist(),
            })),
            Request::SetWhitelist(r) => {
                shared.settings.lock().unwrap().set_whitelist(&r.modes)?;
                shared.broadcast(rpc::Signal::WhitelistedModesChanged(
                    rpc::WhitelistedModesChangedSignal {
                        modes: r.modes.clone(),
                    },
                ));
                Ok(Response::SetWhitelist(rpc::SetWhitelistResponse))
            }
            Request::SetInWhitelist(r) => {
                let mut settings = shared.settings.lock().unwrap();
                let current = settings.whitelist();
                let updated = if r.allowed {
                    crate::settings::list_add(&current, &r.mode)
                } else {
                    crate::settings::list_remove(&current, &r.mode)
                };
                settings.set_whitelist(&updated)?;
                drop(settings);
                shared.broadcast(rpc::Signal::WhitelistedModesChanged(
                    rpc::WhitelistedModesChangedSignal { modes: updated },
                ));
                Ok(Response::SetInWhitelist(rpc::SetInWhitelistResponse))
            }
            Request::GetModes(_) => Ok(Response::GetModes(rpc::GetModesResponse {
                modes: shared.catalog.lock().unwrap().names(),
            })),
            Request::GetAvailableModes(_) => {
                let uid = shared.control.lock().unwrap().user;
                Ok(Response::GetAvailableModes(rpc::GetAvailableModesResponse {
                    modes: available_modes_for(shared, uid),
                }))
            }
            Request::GetAvailableModesForUser(r) => Ok(Response::GetAvailableModesForUser(
                rpc::GetAvailableModesForUserResponse {
                    modes: available_modes_for(shared, r.uid),
                },
            )),
            Request::NetworkSet(r) => {
                shared
                    .settings
                    .lock()
                    .unwrap()
                    .set("network", &r.key, &r.value)?;
                Ok(Response::NetworkSet(rpc::NetworkSetResponse))
            }
            Request::NetworkGet(r) => Ok(Response::NetworkGet(rpc::NetworkGetResponse {
                value: shared
                    .settings
                    .lock()
                    .unwrap()
                    .get_string("network", &r.key)
                    .unwrap_or_default(),
            })),
            Request::ClearUserConfig(_) => {
                let uid = shared.control.lock().unwrap().user;
                shared.settings.lock().unwrap().clear_user(uid)?;
                Ok(Response::ClearUserConfig(rpc::ClearUserConfigResponse))
            }
            Request::RescueOff(_) => {
                let mut state = shared.control.lock().unwrap();
                state.rescue = false;
                state.rescue_in_use = false;
                shared.redecide(&mut state);
                Ok(Response::RescueOff(rpc::RescueOffResponse))
            }
            Request::GetCurrentState(_) => {
                let state = shared.control.lock().unwrap();
                Ok(Response::GetCurrentState(rpc::GetCurrentStateResponse {
                    mode: state.external.clone(),
                }))
            }
        }
    })();

    result.unwrap_or_else(|e| {
        warn!("Request failed: {e:#}");
        Response::Error(rpc::ErrorResponse {
            message: format!("{e:#}"),
        })
    })
}

fn available_modes_for(shared: &Shared, uid: u32) -> Vec<String> {
    let hidden = shared.settings.lock().unwrap().hidden_modes();
    let whitelist = shared.settings.lock().unwrap().whitelist();
    debug!("Resolving available modes for uid {uid}");

    shared
        .catalog
        .lock()
        .unwrap()
        .names()
        .into_iter()
        .filter(|m| !hidden.contains(m))
        .filter(|m| whitelist.is_empty() || whitelist.contains(m))
        .collect()
}

/// Poll the netlink socket and re-evaluate the engine whenever the cable
/// state settles. Uses the same sleep/tick polling shape as
/// `util::cancellable_wait` rather than `poll(2)`, since the socket is
/// already non-blocking and the only deadline that matters is the debounce
/// window.
fn cable_monitor_thread(shared: Arc<Shared>, max_cable_delay: Option<Duration>) -> Result<()> {
    let socket = UeventSocket::open().context("Failed to open uevent netlink socket")?;
    let initial = cable::scan_power_supplies(std::path::Path::new(POWER_SUPPLY_ROOT));
    let mut tracker = CableTracker::new(initial, max_cable_delay);

    info!("Initial cable state: {}", tracker.stable());
    {
        let mut state = shared.control.lock().unwrap();
        state.cable = tracker.stable();
        shared.redecide(&mut state);
    }

    while !shared.shutdown.load(Ordering::SeqCst) {
        while let Some(event) = socket.recv().ok().flatten() {
            if let Some(cable_state) = cable::classify(&event) {
                tracker.observe(cable_state);
            }
        }

        if let Some(new_state) = tracker.tick() {
            on_cable_change(&shared, new_state);
        }

        if !shared.control.lock().unwrap().init_done && probe_init_done() {
            let mut state = shared.control.lock().unwrap();
            state.init_done = true;
            info!("init-done reached");
            shared.redecide(&mut state);
        }

        let poll_interval = tracker
            .next_deadline()
            .unwrap_or(Duration::from_millis(200))
            .min(Duration::from_millis(200));
        thread::sleep(poll_interval);
    }

    Ok(())
}

fn on_cable_change(shared: &Shared, new_state: CableState) {
    let mut state = shared.control.lock().unwrap();
    let previous = state.cable;
    state.cable = new_state;

    if let Some(legacy) = cable::legacy_event_for_transition(previous, new_state) {
        shared.broadcast(rpc::Signal::Event(rpc::EventSignal {
            name: legacy.to_owned(),
        }));
    }

    shared.redecide(&mut state);
}

fn worker_completion_thread(shared: Arc<Shared>, completion_fd: OwnedFd) {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(&completion_fd, &mut buf) {
            Ok(0) => continue,
            Ok(_) => {
                let Some(result) = shared.worker.take_last_result() else {
                    debug!("Worker reported completion with no result recorded");
                    continue;
                };
                on_transition_complete(&shared, result);
            }
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => break,
        }
    }
}

/// Reconcile `ControlState.internal`/`external` with what the worker
/// actually activated and broadcast a fresh `CurrentState`, exiting `busy`
/// (spec §3 "Exit from busy is always accompanied by a fresh current-state
/// broadcast"). On failure, also broadcast `mode_setting_failed` (spec §7).
fn on_transition_complete(shared: &Shared, result: worker::TransitionResult) {
    let mode = if result.failed {
        shared.broadcast(rpc::Signal::Event(rpc::EventSignal {
            name: "mode_setting_failed".to_owned(),
        }));
        map_to_external(&result.activated_hw_mode)
    } else {
        result.external_name
    };

    {
        let mut state = shared.control.lock().unwrap();
        state.internal = mode.clone();
        state.external = mode.clone();
    }

    info!("Transition complete, current mode: {mode}");
    shared.broadcast(rpc::Signal::CurrentState(rpc::CurrentStateSignal { mode }));
}

/// Block reading the signal self-pipe. `SIGHUP` reloads settings and the
/// catalog in place; `SIGTERM`/`SIGINT` exit the process (spec §4.H
/// "shutdown").
fn signal_thread(
    shared: Arc<Shared>,
    signal_fd: OwnedFd,
    config_dir: PathBuf,
    overlay_file: PathBuf,
    mode_dir: PathBuf,
) {
    let mut buf = [0u8; 16];
    loop {
        let n = match rustix::io::read(&signal_fd, &mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => return,
        };

        for &signum in &buf[..n] {
            match signum as i32 {
                libc::SIGHUP => {
                    info!("SIGHUP received, reloading settings and mode catalog");
                    match Settings::load(&config_dir, &overlay_file) {
                        Ok(settings) => *shared.settings.lock().unwrap() = settings,
                        Err(e) => error!("Failed to reload settings: {e:#}"),
                    }
                    *shared.catalog.lock().unwrap() = Catalog::scan(&mode_dir);
                    let mut state = shared.control.lock().unwrap();
                    shared.redecide(&mut state);
                }
                libc::SIGTERM | libc::SIGINT => {
                    info!("Shutting down");
                    shared.shutdown.store(true, Ordering::SeqCst);
                    process::exit(0);
                }
                _ => {}
            }
        }
    }
}

pub fn subcommand_daemon(cli: &DaemonCli) -> Result<()> {
    let _span = info_span!("daemon").entered();

    let settings = Settings::load(&cli.config_dir, &cli.overlay_file)?;
    let catalog = if cli.fallback {
        Catalog::default()
    } else {
        Catalog::scan(&cli.mode_dir)
    };
    let diag_catalog = if cli.diag {
        Some(Catalog::scan_diag(&cli.diag_mode_dir))
    } else {
        None
    };
    let diag_mode = diag_catalog
        .as_ref()
        .and_then(Catalog::diag_mode)
        .map(|d| d.mode_name.clone());

    let backend = BackendKind::probe(CONFIGFS_GADGET_ROOT, ANDROID_USB_ROOT);
    let appsync = AppSync::with_default_dir();
    let (worker, completion_fd) = WorkerHandle::spawn(backend, appsync)?;

    let init_done = probe_init_done();
    let rescue = if cli.rescue && init_done {
        warn!("init done already passed; rescue mode ignored");
        false
    } else {
        cli.rescue
    };

    let control = ControlState {
        rescue,
        diag: cli.diag,
        enabled: true,
        init_done,
        ..Default::default()
    };

    let shared = Arc::new(Shared {
        control: Mutex::new(control),
        settings: Mutex::new(settings),
        catalog: Mutex::new(catalog),
        diag_mode,
        worker,
        subscribers: Mutex::new(vec![]),
        shutdown: AtomicBool::new(false),
    });

    let signal_fd = install_signal_pipe()?;
    let signal_shared = Arc::clone(&shared);
    let (config_dir, overlay_file, mode_dir) =
        (cli.config_dir.clone(), cli.overlay_file.clone(), cli.mode_dir.clone());
    thread::Builder::new()
        .name("usb-moded-signal".into())
        .spawn(move || signal_thread(signal_shared, signal_fd, config_dir, overlay_file, mode_dir))?;

    let completion_shared = Arc::clone(&shared);
    let completion_thread_handle = thread::Builder::new()
        .name("usb-moded-completion".into())
        .spawn(move || worker_completion_thread(completion_shared, completion_fd))?;

    let max_delay = cli.max_cable_delay.map(Duration::from_millis);
    let cable_shared = Arc::clone(&shared);
    thread::Builder::new()
        .name("usb-moded-cable".into())
        .spawn(move || {
            if let Err(e) = cable_monitor_thread(cable_shared, max_delay) {
                error!("Cable monitor thread exited: {e:#}");
            }
        })?;

    remove_stale_socket();
    if let Some(parent) = std::path::Path::new(rpc::SOCKET_PATH).parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {parent:?}"))?;
    }
    let listener = UnixListener::bind(rpc::SOCKET_PATH).context("Failed to listen on domain socket")?;

    if cli.systemd {
        sd_notify_ready();
    }
    info!("usb-moded daemon started");

    thread::scope(|scope| -> Result<()> {
        for stream in listener.incoming() {
            let stream = stream.context("Failed to accept incoming connection")?;
            let peer_uid = rustix::net::sockopt::get_socket_peercred(&stream)
                .map(|cred| cred.uid.as_raw())
                .unwrap_or(crate::state::UNKNOWN_UID);
            let shared = Arc::clone(&shared);

            scope.spawn(move || {
                if let Err(e) = handle_rpc_connection(&shared, stream, peer_uid) {
                    error!("RPC connection failed: {e:#}");
                }
            });
        }

        Ok(())
    })?;

    let _ = completion_thread_handle;
    Ok(())
}
