//! Task State Storage - Cache Access Coordination and Persistent Stores
//!
//! Lets many build threads read and write the task artifact state cache
//! without racing on the store, while keeping the directory lock off the
//! critical path of long-running work.
//!
//! - [`CacheAccessCoordinator`]: session lifecycle, lock ownership, scopes
//! - [`cache`]: named caches, value codecs and the in-memory overlay
//! - [`store`]: lock handles and persistent stores (LMDB, in-memory)

pub mod cache;
pub mod coordinator;
pub mod store;

pub use cache::{
    CacheKey, CacheValue, CodecError, InMemoryOverlay, JsonCodec, NamedCache, OverlayStats,
    ValueCodec, ValueSerialization,
};
pub use coordinator::{
    AccessCounters, CacheAccessCoordinator, CoordinatorStatus, TaskArtifactStateCacheAccess,
};
pub use store::{
    FileLockHandle, LmdbPartition, LmdbStore, LmdbStoreFactory, LockHandle, MemoryLockHandle,
    MemoryStoreFactory, MemoryStoreStats, PersistentStore, RawPartition, StoreFactory,
    StoreLocation,
};
