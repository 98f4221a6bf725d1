// SPDX-License-Identifier: GPL-3.0-only

//! Error kinds that the selection engine and RPC surface need to branch on
//! (spec §7). Everything else in the daemon uses `anyhow::Result` with
//! `.context(...)`, same as the teacher code; this enum exists only at the
//! seams where the *kind* of failure determines behavior, not just whether
//! logging should happen.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Unreadable or ill-formed descriptor/overlay. Discard the item and
    /// keep going.
    #[error("config error: {0}")]
    Config(String),

    /// sysfs/module actuation failed mid-transition.
    #[error("backend error: {0}")]
    Backend(String),

    /// Caller is not allowed to perform the requested operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A mutating RPC call arrived while external mode is `busy`.
    #[error("busy: a mode transition is already in progress")]
    Busy,

    /// The worker aborted the in-flight transition because of a new request.
    #[error("cancelled")]
    Cancelled,

    /// The appsync collaborator's session bus connection dropped.
    #[error("lost connection to session bus")]
    BusDisconnect,
}
