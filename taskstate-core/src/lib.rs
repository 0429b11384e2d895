//! Task State Core - Shared Types
//!
//! Errors, configuration, lock modes and session lifecycle shared by the
//! storage and test crates. This crate performs no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod lock;
pub mod selection;
pub mod session;

pub use config::{
    lock_path_for, CacheAccessConfig, ParallelismMode, TASK_ARTIFACTS_CACHE_NAME,
    TASK_ARTIFACTS_DISPLAY_NAME,
};
pub use error::{
    ConfigError, LockError, SessionError, StorageError, TaskStateError, TaskStateResult,
};
pub use lock::{HeldLock, LockMode, LockModeParseError};
pub use selection::{ComponentSelectionReason, SelectionReasonError};
pub use session::SessionState;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier of one coordinator session, UUIDv7 so sessions sort by start time.
pub type SessionId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new session identifier.
pub fn new_session_id() -> SessionId {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_v7_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.get_version_num(), 7);
    }
}
