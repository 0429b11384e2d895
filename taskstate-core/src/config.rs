//! Configuration types

use crate::{ConfigError, LockMode, TaskStateError, TaskStateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the task artifact state cache directory.
pub const TASK_ARTIFACTS_CACHE_NAME: &str = "taskArtifacts";

/// Display name used in logs and lock timeout messages.
pub const TASK_ARTIFACTS_DISPLAY_NAME: &str = "task artifact state cache";

/// Whether cache access scopes may be requested from several threads at once.
///
/// Fixed for the lifetime of a coordinator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelismMode {
    /// A single build thread is expected to use the cache
    Serial,
    /// Several worker threads share the cache, serialized by the coordinator
    Parallel,
}

impl ParallelismMode {
    /// Derive the mode from the configured worker thread count.
    ///
    /// Zero means the build does not execute tasks in parallel.
    pub fn from_thread_count(parallel_thread_count: usize) -> Self {
        if parallel_thread_count == 0 {
            ParallelismMode::Serial
        } else {
            ParallelismMode::Parallel
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ParallelismMode::Parallel)
    }
}

impl fmt::Display for ParallelismMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParallelismMode::Serial => write!(f, "serial"),
            ParallelismMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Configuration consumed once when a cache access coordinator is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheAccessConfig {
    /// Root directory holding the cache; the store lives in `cache_dir/cache_name`.
    pub cache_dir: PathBuf,
    pub cache_name: String,
    pub display_name: String,
    pub lock_mode: LockMode,
    /// Worker thread count of the build; 0 selects serial mode.
    pub parallel_thread_count: usize,
    /// Bounded wait for the cross-process lock.
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    /// LMDB map size.
    pub map_size_mb: usize,
    /// Maximum number of named caches (LMDB named databases).
    pub max_partitions: u32,
}

impl Default for CacheAccessConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::new(),
            cache_name: TASK_ARTIFACTS_CACHE_NAME.to_string(),
            display_name: TASK_ARTIFACTS_DISPLAY_NAME.to_string(),
            lock_mode: LockMode::Exclusive,
            parallel_thread_count: 0,
            lock_timeout_ms: 60_000,
            lock_poll_interval_ms: 50,
            map_size_mb: 64,
            max_partitions: 32,
        }
    }
}

impl CacheAccessConfig {
    /// Build the configuration of the task artifact state cache under `cache_dir`.
    pub fn task_artifacts(cache_dir: impl Into<PathBuf>, parallel_thread_count: usize) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            parallel_thread_count,
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml_str(input: &str) -> TaskStateResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| {
            TaskStateError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache name (directory and lock file stem).
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the lock mode.
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Set the worker thread count.
    pub fn with_parallel_thread_count(mut self, count: usize) -> Self {
        self.parallel_thread_count = count;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the lock poll interval.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the LMDB map size.
    pub fn with_map_size_mb(mut self, size: usize) -> Self {
        self.map_size_mb = size;
        self
    }

    /// Set the maximum number of named caches.
    pub fn with_max_partitions(mut self, count: u32) -> Self {
        self.max_partitions = count;
        self
    }

    pub fn parallelism(&self) -> ParallelismMode {
        ParallelismMode::from_thread_count(self.parallel_thread_count)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Directory holding the store files and the lock file.
    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.cache_name)
    }

    /// Path of the advisory lock file.
    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.store_dir(), &self.cache_name)
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(TaskStateError::Config) if invalid.
    pub fn validate(&self) -> TaskStateResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache_dir".to_string(),
            }
            .into());
        }

        if self.cache_name.trim().is_empty() {
            return Err(invalid("cache_name", &self.cache_name, "cache_name must not be empty"));
        }

        if self.cache_name.contains(|c: char| c == '/' || c == '\\') {
            return Err(invalid(
                "cache_name",
                &self.cache_name,
                "cache_name must not contain path separators",
            ));
        }

        if self.display_name.trim().is_empty() {
            return Err(invalid(
                "display_name",
                &self.display_name,
                "display_name must not be empty",
            ));
        }

        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms", "0", "lock_timeout_ms must be positive"));
        }

        if self.lock_poll_interval_ms == 0 {
            return Err(invalid(
                "lock_poll_interval_ms",
                "0",
                "lock_poll_interval_ms must be positive",
            ));
        }

        if self.lock_poll_interval_ms > self.lock_timeout_ms {
            return Err(invalid(
                "lock_poll_interval_ms",
                &self.lock_poll_interval_ms.to_string(),
                "lock_poll_interval_ms must not exceed lock_timeout_ms",
            ));
        }

        if self.map_size_mb == 0 {
            return Err(invalid("map_size_mb", "0", "map_size_mb must be positive"));
        }

        if self.max_partitions == 0 {
            return Err(invalid("max_partitions", "0", "max_partitions must be positive"));
        }

        Ok(())
    }
}

/// Lock file location for a store directory.
pub fn lock_path_for(store_dir: &Path, cache_name: &str) -> PathBuf {
    store_dir.join(format!("{}.lock", cache_name))
}

fn invalid(field: &str, value: &str, reason: &str) -> TaskStateError {
    TaskStateError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> CacheAccessConfig {
        CacheAccessConfig::task_artifacts("/tmp/build-cache", 4)
    }

    #[test]
    fn test_task_artifacts_defaults() {
        let config = valid_config();
        assert_eq!(config.cache_name, "taskArtifacts");
        assert_eq!(config.display_name, "task artifact state cache");
        assert_eq!(config.lock_mode, LockMode::Exclusive);
        assert_eq!(config.parallelism(), ParallelismMode::Parallel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threads_is_serial() {
        assert_eq!(ParallelismMode::from_thread_count(0), ParallelismMode::Serial);
        assert_eq!(ParallelismMode::from_thread_count(1), ParallelismMode::Parallel);
        assert_eq!(ParallelismMode::from_thread_count(16), ParallelismMode::Parallel);
    }

    #[test]
    fn test_store_and_lock_paths() {
        let config = valid_config();
        assert_eq!(config.store_dir(), PathBuf::from("/tmp/build-cache/taskArtifacts"));
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/tmp/build-cache/taskArtifacts/taskArtifacts.lock")
        );
    }

    #[test]
    fn test_validate_missing_cache_dir() {
        let config = CacheAccessConfig::default();
        match config.validate() {
            Err(TaskStateError::Config(ConfigError::MissingRequired { field })) => {
                assert_eq!(field, "cache_dir");
            }
            other => panic!("Expected MissingRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = valid_config().with_lock_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(TaskStateError::Config(ConfigError::InvalidValue { ref field, .. })) if field == "lock_timeout_ms"
        ));
    }

    #[test]
    fn test_validate_poll_interval_exceeds_timeout() {
        let config = valid_config()
            .with_lock_timeout(Duration::from_millis(100))
            .with_lock_poll_interval(Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_path_separator_in_name() {
        let config = valid_config().with_cache_name("../escape");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str_with_defaults() {
        let config = CacheAccessConfig::from_toml_str(
            r#"
            cache_dir = "/var/cache/build"
            parallel_thread_count = 8
            lock_mode = "Shared"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/build"));
        assert_eq!(config.parallelism(), ParallelismMode::Parallel);
        assert_eq!(config.lock_mode, LockMode::Shared);
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert_eq!(config.cache_name, TASK_ARTIFACTS_CACHE_NAME);
    }

    #[test]
    fn test_from_toml_str_parse_error() {
        let result = CacheAccessConfig::from_toml_str("cache_dir = [");
        assert!(matches!(
            result,
            Err(TaskStateError::Config(ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn test_from_toml_str_runs_validation() {
        let result = CacheAccessConfig::from_toml_str(
            r#"
            cache_dir = "/var/cache/build"
            map_size_mb = 0
            "#,
        );
        assert!(matches!(
            result,
            Err(TaskStateError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
