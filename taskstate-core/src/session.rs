//! Coordinator session lifecycle states.
//!
//! ```text
//! NotStarted ── start() ──→ Running ── stop() ──→ Stopping ──→ Stopped
//! ```
//!
//! `Stopping` lasts while `stop()` waits for in-flight scopes to drain. New
//! scopes are refused from the moment it is entered, except nested scopes of
//! threads that are already inside one.

use crate::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a cache access session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    /// Check that a new top-level scope may be entered in this state.
    pub fn ensure_accepting(&self) -> Result<(), SessionError> {
        match self {
            SessionState::Running => Ok(()),
            SessionState::NotStarted => Err(SessionError::NotStarted),
            SessionState::Stopping | SessionState::Stopped => Err(SessionError::AlreadyStopped),
        }
    }

    /// Transition for `start()`.
    pub fn start(&self) -> Result<SessionState, SessionError> {
        match self {
            SessionState::NotStarted => Ok(SessionState::Running),
            SessionState::Running => Err(SessionError::AlreadyStarted),
            SessionState::Stopping | SessionState::Stopped => Err(SessionError::AlreadyStopped),
        }
    }

    /// Transition for `stop()`.
    pub fn begin_stop(&self) -> Result<SessionState, SessionError> {
        match self {
            SessionState::Running => Ok(SessionState::Stopping),
            SessionState::NotStarted => Err(SessionError::NotStarted),
            SessionState::Stopping | SessionState::Stopped => Err(SessionError::AlreadyStopped),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not started",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}
