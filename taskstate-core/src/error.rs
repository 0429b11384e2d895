//! Error types for task state cache operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coordinator session lifecycle and scoping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cache access session has not been started")]
    NotStarted,

    #[error("Cache access session is already running")]
    AlreadyStarted,

    #[error("Cache access session has been stopped")]
    AlreadyStopped,

    #[error("Cache '{cache}' accessed outside of a cache access scope")]
    OutsideCacheAccess { cache: String },

    #[error("Cannot stop the cache access session from inside one of its scopes")]
    StopInsideScope,

    #[error("Cache '{cache}' is already registered with different key or value types")]
    CacheTypeMismatch { cache: String },
}

/// Cross-process file lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error(
        "Timeout waiting to lock {display_name} ({}). It is currently in use by another process. Waited {waited:?}",
        .lock_path.display()
    )]
    Timeout {
        display_name: String,
        lock_path: PathBuf,
        waited: Duration,
    },

    #[error("Lock file I/O failed for {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },
}

/// Persistent store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open store {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization failed for cache '{cache}': {reason}")]
    Serialization { cache: String, reason: String },

    #[error("Deserialization failed for cache '{cache}': {reason}")]
    Deserialization { cache: String, reason: String },

    #[error("Cache '{cache}' was opened with a shared lock and is read-only")]
    ReadOnly { cache: String },

    #[error("Store is closed")]
    Closed,

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for task state cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskStateError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TaskStateError {
    /// Whether the error came from waiting on the cross-process lock.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, TaskStateError::Lock(LockError::Timeout { .. }))
    }
}

/// Result type alias for task state cache operations.
pub type TaskStateResult<T> = Result<T, TaskStateError>;

// =============================================================================
// TESTS
// =============================================================================
