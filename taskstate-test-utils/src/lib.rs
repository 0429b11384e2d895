//! Task State Test Utilities
//!
//! Shared test infrastructure for the task state workspace:
//! - Proptest generators for configuration and cache contents
//! - Fixtures building coordinators over in-memory and LMDB stores
//! - Custom assertions for coordinator error kinds
//! - Test tracing setup

// Re-export the in-memory store from its source crate
pub use taskstate_storage::{
    CacheAccessCoordinator, JsonCodec, MemoryStoreFactory, MemoryStoreStats, NamedCache,
    StoreFactory, ValueSerialization,
};

// Re-export core types for convenience
pub use taskstate_core::{
    CacheAccessConfig, ComponentSelectionReason, ConfigError, LockError, LockMode,
    ParallelismMode, SessionError, SessionState, StorageError, TaskStateError, TaskStateResult,
};

use std::time::Duration;

/// Install a fmt subscriber writing through the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for task state types.

    use super::*;
    use proptest::prelude::*;

    /// One operation against a named cache.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CacheOp {
        Put(String, u64),
        Get(String),
        Remove(String),
    }

    pub fn arb_lock_mode() -> impl Strategy<Value = LockMode> {
        prop_oneof![Just(LockMode::Exclusive), Just(LockMode::Shared)]
    }

    /// Worker thread counts, biased toward serial builds.
    pub fn arb_thread_count() -> impl Strategy<Value = usize> {
        prop_oneof![Just(0usize), 1usize..16]
    }

    pub fn arb_parallelism() -> impl Strategy<Value = ParallelismMode> {
        arb_thread_count().prop_map(ParallelismMode::from_thread_count)
    }

    /// Names usable as cache names and directory names.
    pub fn arb_cache_name() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9]{0,15}"
    }

    /// Keys drawn from a small alphabet so generated operations collide.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-e]{1,2}"
    }

    pub fn arb_value() -> impl Strategy<Value = u64> {
        any::<u64>()
    }

    pub fn arb_cache_op() -> impl Strategy<Value = CacheOp> {
        prop_oneof![
            3 => (arb_key(), arb_value()).prop_map(|(k, v)| CacheOp::Put(k, v)),
            3 => arb_key().prop_map(CacheOp::Get),
            1 => arb_key().prop_map(CacheOp::Remove),
        ]
    }

    pub fn arb_cache_ops(max: usize) -> impl Strategy<Value = Vec<CacheOp>> {
        prop::collection::vec(arb_cache_op(), 0..max)
    }

    pub fn arb_selection_reason() -> impl Strategy<Value = ComponentSelectionReason> {
        prop_oneof![
            Just(ComponentSelectionReason::REQUESTED),
            Just(ComponentSelectionReason::ROOT),
            Just(ComponentSelectionReason::FORCED),
            Just(ComponentSelectionReason::CONFLICT_RESOLUTION),
            Just(ComponentSelectionReason::SELECTED_BY_RULE),
            Just(ComponentSelectionReason::CONFLICT_RESOLUTION_BY_RULE),
        ]
    }

    /// Generate a CacheAccessConfig that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheAccessConfig> {
        (
            arb_cache_name(),
            arb_lock_mode(),
            arb_thread_count(),
            1u64..600_000,
            1usize..1024,
            1u32..128,
        )
            .prop_flat_map(|(name, mode, threads, timeout_ms, map_size_mb, max_partitions)| {
                (1u64..=timeout_ms).prop_map(move |poll_ms| {
                    CacheAccessConfig::task_artifacts("/tmp/build-cache", threads)
                        .with_cache_name(name.clone())
                        .with_lock_mode(mode)
                        .with_lock_timeout(Duration::from_millis(timeout_ms))
                        .with_lock_poll_interval(Duration::from_millis(poll_ms))
                        .with_map_size_mb(map_size_mb)
                        .with_max_partitions(max_partitions)
                })
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built coordinators and configurations for common scenarios.

    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Short lock timeout used by fixtures so contention tests fail fast.
    pub const TEST_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

    pub const TEST_POLL_INTERVAL: Duration = Duration::from_millis(2);

    /// Configuration for a coordinator over [`MemoryStoreFactory`].
    ///
    /// The directory is never touched by the in-memory store.
    pub fn memory_config(parallel_thread_count: usize) -> CacheAccessConfig {
        CacheAccessConfig::task_artifacts("/memory/build-cache", parallel_thread_count)
            .with_lock_timeout(TEST_LOCK_TIMEOUT)
            .with_lock_poll_interval(TEST_POLL_INTERVAL)
    }

    /// An unstarted coordinator and the factory behind it.
    pub fn memory_coordinator(parallel_thread_count: usize) -> (CacheAccessCoordinator, MemoryStoreFactory) {
        coordinator_over(&memory_config(parallel_thread_count), &MemoryStoreFactory::new())
    }

    /// A started coordinator and the factory behind it.
    pub fn started_memory_coordinator(
        parallel_thread_count: usize,
    ) -> (CacheAccessCoordinator, MemoryStoreFactory) {
        let (access, factory) = memory_coordinator(parallel_thread_count);
        if let Err(e) = access.start() {
            panic!("Failed to start coordinator: {}", e);
        }
        (access, factory)
    }

    /// A coordinator over an existing factory, e.g. a second session on the same data.
    pub fn coordinator_over(
        config: &CacheAccessConfig,
        factory: &MemoryStoreFactory,
    ) -> (CacheAccessCoordinator, MemoryStoreFactory) {
        let shared: Arc<dyn StoreFactory> = Arc::new(factory.clone());
        match CacheAccessCoordinator::new(config, shared) {
            Ok(access) => (access, factory.clone()),
            Err(e) => panic!("Failed to build coordinator: {}", e),
        }
    }

    /// Configuration for an LMDB-backed coordinator rooted at `cache_dir`.
    pub fn lmdb_config(cache_dir: &Path, parallel_thread_count: usize) -> CacheAccessConfig {
        CacheAccessConfig::task_artifacts(cache_dir, parallel_thread_count)
            .with_lock_timeout(TEST_LOCK_TIMEOUT)
            .with_lock_poll_interval(TEST_POLL_INTERVAL)
            .with_map_size_mb(16)
    }

    /// A fresh temporary cache directory.
    pub fn temp_cache_dir() -> TempDir {
        match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => panic!("Failed to create temp dir: {}", e),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for coordinator results.

    use super::*;

    /// Assert that a TaskStateResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TaskStateResult<T>) {
        if let Err(e) = result {
            panic!("Expected Ok, got Err: {:?}", e);
        }
    }

    /// Assert that a TaskStateResult is the given session error.
    #[track_caller]
    pub fn assert_session_error<T: std::fmt::Debug>(result: &TaskStateResult<T>, expected: SessionError) {
        match result {
            Err(TaskStateError::Session(actual)) => {
                assert_eq!(*actual, expected, "Wrong session error");
            }
            other => panic!("Expected Session({:?}), got: {:?}", expected, other),
        }
    }

    /// Assert that a TaskStateResult is a lock timeout naming `display_name`.
    #[track_caller]
    pub fn assert_lock_timeout<T: std::fmt::Debug>(result: &TaskStateResult<T>, display_name: &str) {
        match result {
            Err(TaskStateError::Lock(LockError::Timeout { display_name: name, .. })) => {
                assert_eq!(name, display_name, "Timeout names the wrong cache");
            }
            other => panic!("Expected lock Timeout, got: {:?}", other),
        }
    }

    /// Assert that a TaskStateResult is a storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &TaskStateResult<T>) {
        match result {
            Err(TaskStateError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a TaskStateResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &TaskStateResult<T>) {
        match result {
            Err(TaskStateError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a CacheAccessConfig is valid.
    #[track_caller]
    pub fn assert_config_valid(config: &CacheAccessConfig) {
        if let Err(e) = config.validate() {
            panic!("Config should be valid: {:?}", e);
        }
    }

    /// Assert that no thread ever overlapped another inside the store.
    #[track_caller]
    pub fn assert_serialized_access(factory: &MemoryStoreFactory) {
        let stats = factory.stats();
        assert!(
            stats.max_concurrent_access <= 1,
            "Store was entered by {} threads at once",
            stats.max_concurrent_access
        );
    }

    /// Assert that the store's lock is currently free.
    #[track_caller]
    pub fn assert_unlocked(factory: &MemoryStoreFactory) {
        assert!(!factory.is_locked(), "Store lock is still held");
    }
}

// ============================================================================
// TESTS
// ============================================================================
