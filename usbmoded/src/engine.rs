// SPDX-License-Identifier: GPL-3.0-only

//! The mode selection engine (spec §4.G): turns a cable state, the current
//! settings, and the mode catalog into a target mode, without touching any
//! hardware itself. Runs on the main thread; its output is handed to the
//! worker thread as a `WorkerRequest` (spec §4.H).

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::settings::Settings;
use crate::state::{dynamic_mode, internal_mode, CableState, ControlState, ModeName, UNKNOWN_UID};

/// How long an `ask`-pending target is held before giving up and falling
/// back to plain charging (spec §4.G "Pending user choice").
pub const PENDING_USER_CHOICE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The target mode changed; worker should be asked to transition.
    TargetChanged { from: ModeName, to: ModeName },
    /// A dynamic mode was selected (as opposed to one of the internal modes).
    SelectedModeChanged(ModeName),
    /// The `ask` gate opened or closed.
    PendingUserChange(bool),
}

/// Inputs the engine needs beyond the `ControlState` it mutates, kept
/// explicit instead of folded into the state so callers can see exactly
/// what's read on each decision.
pub struct DecisionInputs<'a> {
    pub settings: &'a mut Settings,
    pub catalog: &'a Catalog,
    pub diag_mode: Option<&'a str>,
}

/// Re-evaluate `state.target` from scratch given the current cable state,
/// settings, and catalog. Returns the events the caller (daemon.rs) should
/// broadcast and act on. Idempotent: calling this twice in a row with no
/// inputs changed produces no events.
pub fn decide(state: &mut ControlState, inputs: DecisionInputs<'_>) -> Vec<EngineEvent> {
    let DecisionInputs {
        settings,
        catalog,
        diag_mode,
    } = inputs;

    let previous_target = state.target.clone();
    let mut events = vec![];

    if !state.enabled {
        set_target(state, internal_mode::UNDEFINED.to_owned(), &mut events);
        return finish(state, previous_target, events);
    }

    match state.cable {
        CableState::Unknown => {
            // Nothing known yet; leave whatever target was last computed.
        }
        CableState::Disconnected => {
            state.selected = None;
            state.rescue_in_use = false;
            clear_pending(state, &mut events);
            set_target(state, internal_mode::UNDEFINED.to_owned(), &mut events);
        }
        CableState::ChargerConnected => {
            clear_pending(state, &mut events);
            set_target(state, internal_mode::DEDICATED_CHARGER.to_owned(), &mut events);
        }
        CableState::PcConnected => {
            decide_pc_connected(state, settings, catalog, diag_mode, &mut events);
        }
    }

    finish(state, previous_target, events)
}

fn decide_pc_connected(
    state: &mut ControlState,
    settings: &mut Settings,
    catalog: &Catalog,
    diag_mode: Option<&str>,
    events: &mut Vec<EngineEvent>,
) {
    // Step 3: rescue sessions target `developer_mode` once, independent of
    // diagnostic mode, and latch for the rest of the session.
    if state.rescue && !state.rescue_in_use {
        state.rescue_in_use = true;
        info!("Entering rescue mode for this session");
    }

    if state.rescue_in_use {
        clear_pending(state, events);
        set_target(state, dynamic_mode::DEVELOPER_MODE.to_owned(), events);
        return;
    }

    // Step 4: diagnostic mode is a separate flag/catalog entirely.
    if state.diag {
        clear_pending(state, events);
        let name = diag_mode.unwrap_or(internal_mode::CHARGING_ONLY_FALLBACK).to_owned();
        set_target(state, name, events);
        return;
    }

    // Step 5: hold at `charging_only_fallback` until early boot bookkeeping
    // has settled.
    if !state.init_done {
        clear_pending(state, events);
        set_target(state, internal_mode::CHARGING_ONLY_FALLBACK.to_owned(), events);
        return;
    }

    // Step 6: shutdown in progress; freeze whatever mode is currently active.
    if state.in_shutdown {
        return;
    }

    let resolved = if let Some(selected) = state.selected.clone() {
        if catalog.contains(&selected) {
            Some(selected)
        } else {
            debug!("Previously selected mode {selected:?} is no longer installed, re-resolving");
            state.selected = None;
            None
        }
    } else {
        None
    };

    let whitelist = settings.whitelist();
    let hidden = settings.hidden_modes();
    let is_allowed = |name: &str| -> bool {
        catalog.contains(name) && !hidden.iter().any(|h| h == name) && (whitelist.is_empty() || whitelist.iter().any(|w| w == name))
    };

    let resolved = match resolved {
        Some(name) => name,
        None => settings
            .get_mode_setting(state.user, is_allowed)
            .unwrap_or_else(|e| {
                debug!("Failed to read mode setting: {e}");
                internal_mode::ASK.to_owned()
            }),
    };

    if resolved == internal_mode::ASK {
        set_pending(state, events);
        set_target(state, internal_mode::ASK.to_owned(), events);
        return;
    }

    if !is_allowed(&resolved) {
        clear_pending(state, events);
        set_target(state, internal_mode::CHARGING_ONLY_FALLBACK.to_owned(), events);
        return;
    }

    // Step 11: the same dynamic mode is already active, but a different user
    // is now the one asking for it; don't silently hand it over.
    if resolved == state.internal && state.current_user != UNKNOWN_UID && state.current_user != state.user {
        clear_pending(state, events);
        set_target(state, internal_mode::CHARGING_ONLY_FALLBACK.to_owned(), events);
        return;
    }

    // Step 12: device-lock gating of dynamic modes.
    if !state.can_export || state.pending_user_change {
        clear_pending(state, events);
        set_target(state, internal_mode::CHARGING_ONLY_FALLBACK.to_owned(), events);
        return;
    }

    clear_pending(state, events);
    events.push(EngineEvent::SelectedModeChanged(resolved.clone()));
    set_target(state, resolved, events);
}

/// Record an explicit `SetMode` selection (spec §4.I): only meaningful while
/// a PC is connected; cleared automatically on disconnect.
pub fn select_mode(state: &mut ControlState, name: ModeName) {
    state.selected = Some(name);
}

fn set_target(state: &mut ControlState, target: ModeName, events: &mut Vec<EngineEvent>) {
    if state.target != target {
        events.push(EngineEvent::TargetChanged {
            from: state.target.clone(),
            to: target.clone(),
        });
        state.target = target;
    }
}

fn set_pending(state: &mut ControlState, events: &mut Vec<EngineEvent>) {
    if !state.pending_user_change {
        state.pending_user_change = true;
        events.push(EngineEvent::PendingUserChange(true));
    }
}

fn clear_pending(state: &mut ControlState, events: &mut Vec<EngineEvent>) {
    if state.pending_user_change {
        state.pending_user_change = false;
        events.push(EngineEvent::PendingUserChange(false));
    }
}

fn finish(state: &mut ControlState, previous_target: ModeName, events: Vec<EngineEvent>) -> Vec<EngineEvent> {
    if state.target != previous_target {
        debug!("Target mode: {previous_target:?} -> {:?}", state.target);
    }
    events
}

/// A deadline-tracking helper for the "ask" gate: the engine sets
/// `pending_user_change`, but a client must answer within
/// [`PENDING_USER_CHOICE_TIMEOUT`] or the daemon falls back to plain
/// charging (spec §4.G).
pub struct PendingChoiceTimer {
    deadline: Option<Instant>,
}

impl PendingChoiceTimer {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + PENDING_USER_CHOICE_TIMEOUT);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for PendingChoiceTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings_with_mode(mode: &str) -> Settings {
        let dir = tempdir().unwrap();
        let overlay = dir.path().join("overlay.ini");
        let mut settings = Settings::load(dir.path(), overlay).unwrap();
        settings.set("usbmode", "mode", mode).unwrap();
        // Leak the tempdir for the duration of the test process; fine since
        // these are short-lived unit tests.
        std::mem::forget(dir);
        settings
    }

    fn catalog_with(names: &[&str]) -> Catalog {
        let dir = tempdir().unwrap();
        for name in names {
            std::fs::write(
                dir.path().join(format!("{name}.ini")),
                format!("[mode]\nmode_name={name}\nappsync=1\n"),
            )
            .unwrap();
        }
        let catalog = Catalog::scan(dir.path());
        std::mem::forget(dir);
        catalog
    }

    #[test]
    fn disconnect_forces_undefined_and_clears_selection() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::Disconnected,
            selected: Some("mtp_mode".to_owned()),
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        let events = decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::UNDEFINED);
        assert!(state.selected.is_none());
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::TargetChanged { .. })));
    }

    #[test]
    fn charger_connected_selects_dedicated_charger() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::ChargerConnected,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::DEDICATED_CHARGER);
    }

    #[test]
    fn pc_connected_resolves_preferred_mode() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        let events = decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, "mtp_mode");
        assert!(!state.pending_user_change);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::SelectedModeChanged(m) if m == "mtp_mode")));
    }

    #[test]
    fn pc_connected_with_ask_sets_pending_flag() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            ..Default::default()
        };
        let mut settings = settings_with_mode("ask");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::ASK);
        assert!(state.pending_user_change);
    }

    #[test]
    fn not_init_done_holds_at_charging_only_fallback() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: false,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::CHARGING_ONLY_FALLBACK);
    }

    #[test]
    fn shutdown_freezes_current_target() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            in_shutdown: true,
            target: "mtp_mode".to_owned(),
            internal: "mtp_mode".to_owned(),
            ..Default::default()
        };
        let mut settings = settings_with_mode("rndis_mode");
        let catalog = catalog_with(&["mtp_mode", "rndis_mode"]);

        let events = decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, "mtp_mode");
        assert!(events.is_empty());
    }

    #[test]
    fn device_lock_gates_dynamic_mode_to_fallback() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            can_export: false,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::CHARGING_ONLY_FALLBACK);
    }

    #[test]
    fn user_switch_redirects_reused_dynamic_mode_to_fallback() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            internal: "mtp_mode".to_owned(),
            user: 100000,
            current_user: 100001,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::CHARGING_ONLY_FALLBACK);
    }

    #[test]
    fn disabled_daemon_always_targets_undefined() {
        let mut state = ControlState {
            enabled: false,
            cable: CableState::PcConnected,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::UNDEFINED);
    }

    #[test]
    fn rescue_session_targets_developer_mode() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            rescue: true,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                // Rescue is independent of diagnostic mode: even with a
                // diag catalog present, rescue still wins.
                diag_mode: Some("diag_mode"),
            },
        );

        assert_eq!(state.target, dynamic_mode::DEVELOPER_MODE);
        assert!(state.rescue_in_use);
    }

    #[test]
    fn diag_flag_targets_diagnostic_mode_without_rescue() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            diag: true,
            init_done: true,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        let catalog = catalog_with(&["mtp_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: Some("diag_mode"),
            },
        );

        assert_eq!(state.target, "diag_mode");
    }

    #[test]
    fn whitelist_blocks_non_member_modes() {
        let mut state = ControlState {
            enabled: true,
            cable: CableState::PcConnected,
            init_done: true,
            ..Default::default()
        };
        let mut settings = settings_with_mode("mtp_mode");
        settings.set_whitelist(&["rndis_mode".to_owned()]).unwrap();
        let catalog = catalog_with(&["mtp_mode", "rndis_mode"]);

        decide(
            &mut state,
            DecisionInputs {
                settings: &mut settings,
                catalog: &catalog,
                diag_mode: None,
            },
        );

        assert_eq!(state.target, internal_mode::CHARGING_ONLY_FALLBACK);
    }
}
