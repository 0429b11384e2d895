//! Lock modes and held-lock bookkeeping for the cache directory lock.
//!
//! The cache directory is guarded by a single advisory file lock. The mode it
//! is requested in is fixed when the store is declared; the coordinator may
//! acquire and release it many times during one session.
//!
//! ```text
//! (unlocked) ─── acquire(mode, timeout) ──→ held ─── release() ──→ (unlocked)
//!                      │
//!                 timeout ──→ LockError::Timeout
//! ```

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// LOCK MODE ENUM
// ============================================================================

/// Lock mode determining cross-process concurrency behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Only one process can hold the lock
    #[default]
    Exclusive,
    /// Multiple processes can hold the lock for reading
    Shared,
}

impl LockMode {
    /// Convert to the string representation used in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "Exclusive",
            LockMode::Shared => "Shared",
        }
    }

    /// Parse from a config string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self, LockModeParseError> {
        match s.to_lowercase().as_str() {
            "exclusive" => Ok(LockMode::Exclusive),
            "shared" => Ok(LockMode::Shared),
            _ => Err(LockModeParseError(s.to_string())),
        }
    }

    /// Whether a store opened under this mode may be written to.
    pub fn allows_writes(&self) -> bool {
        matches!(self, LockMode::Exclusive)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = LockModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error when parsing an invalid lock mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockModeParseError(pub String);

impl fmt::Display for LockModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid lock mode: {}", self.0)
    }
}

impl std::error::Error for LockModeParseError {}

// ============================================================================
// HELD LOCK
// ============================================================================

/// Record of a currently held file lock.
///
/// Produced by a lock handle on successful acquisition and surfaced through
/// coordinator status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldLock {
    pub lock_path: PathBuf,
    pub mode: LockMode,
    pub acquired_at: Timestamp,
}

impl HeldLock {
    pub fn new(lock_path: impl Into<PathBuf>, mode: LockMode, acquired_at: Timestamp) -> Self {
        Self {
            lock_path: lock_path.into(),
            mode,
            acquired_at,
        }
    }

    /// How long the lock has been held as of `now`.
    pub fn held_for(&self, now: Timestamp) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_lock_mode_roundtrip() {
        for mode in [LockMode::Exclusive, LockMode::Shared] {
            let parsed = LockMode::parse(mode.as_str()).unwrap();
            assert_eq!(mode, parsed);
        }
    }

    #[test]
    fn test_lock_mode_parse_is_case_insensitive() {
        assert_eq!("SHARED".parse::<LockMode>().unwrap(), LockMode::Shared);
        assert_eq!("exclusive".parse::<LockMode>().unwrap(), LockMode::Exclusive);
    }

    #[test]
    fn test_lock_mode_parse_rejects_unknown() {
        let err = LockMode::parse("upgradable").unwrap_err();
        assert_eq!(err.to_string(), "Invalid lock mode: upgradable");
    }

    #[test]
    fn test_only_exclusive_allows_writes() {
        assert!(LockMode::Exclusive.allows_writes());
        assert!(!LockMode::Shared.allows_writes());
    }

    #[test]
    fn test_held_for_never_negative() {
        let now = Utc::now();
        let held = HeldLock::new("/tmp/x.lock", LockMode::Exclusive, now + chrono::Duration::seconds(5));
        assert_eq!(held.held_for(now), Duration::ZERO);

        let held = HeldLock::new("/tmp/x.lock", LockMode::Exclusive, now - chrono::Duration::seconds(5));
        assert!(held.held_for(now) >= Duration::from_secs(5));
    }
}
