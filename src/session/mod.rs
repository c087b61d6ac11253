//! Session state
//!
//! - `SessionStore`: the server's sessions and their outstanding ids
//! - `ClientSession`: the client's pool of unused ids
//! - `ReplayGuard` / `ReplayWindow`: bounded tag-id sets for replay defense

mod client;
mod replay;
mod store;

pub use client::ClientSession;
pub use replay::{ReplayGuard, ReplayWindow, GLOBAL_REPLAY_CAPACITY, SESSION_REPLAY_CAPACITY};
pub use store::{Resumed, Session, SessionStore, UsageGuard, DEFAULT_IDLE_TIMEOUT};

use thiserror::Error;

/// Session lookup errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown session id")]
    NotFound,

    #[error("Session id tag mismatch")]
    TagMismatch,

    #[error("Session expired")]
    Expired,

    #[error("Replayed session id")]
    ReplayDetected,

    #[error("Malformed session opener")]
    Malformed,
}
