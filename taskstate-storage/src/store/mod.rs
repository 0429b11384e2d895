//! Persistent store boundary.
//!
//! The coordinator never touches files directly. It asks a [`StoreFactory`]
//! for a [`LockHandle`] guarding the cache directory and, once the lock is
//! held, for a [`PersistentStore`] exposing one [`RawPartition`] per named
//! cache. Partitions move opaque bytes; encoding lives in the cache layer.
//!
//! Two factories are provided:
//! - [`LmdbStoreFactory`]: heed/LMDB environment plus an fs2 advisory lock file
//! - [`MemoryStoreFactory`]: process-local store used by tests, with
//!   instrumentation for observing concurrent access

pub mod file_lock;
pub mod lmdb_backend;
pub mod memory;

pub use file_lock::FileLockHandle;
pub use lmdb_backend::{LmdbPartition, LmdbStore, LmdbStoreFactory};
pub use memory::{MemoryLockHandle, MemoryStoreFactory, MemoryStoreStats};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use taskstate_core::{lock_path_for, CacheAccessConfig, HeldLock, LockError, LockMode, StorageError};

/// Where a store lives and how it is named in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    /// Directory holding the store files and the lock file.
    pub dir: PathBuf,
    pub name: String,
    pub display_name: String,
}

impl StoreLocation {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            display_name: display_name.into(),
        }
    }

    pub fn from_config(config: &CacheAccessConfig) -> Self {
        Self::new(config.store_dir(), &config.cache_name, &config.display_name)
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.dir, &self.name)
    }
}

/// Handle on the cross-process lock of one cache directory.
///
/// A handle is reusable: it may be acquired and released any number of times.
/// Acquiring an already held handle in the same mode is a no-op that returns
/// the existing record.
pub trait LockHandle: Send {
    /// Block until the lock is held in `mode` or `timeout` elapses.
    fn acquire(&mut self, mode: LockMode, timeout: Duration) -> Result<HeldLock, LockError>;

    /// Release the lock. Releasing an unheld handle is a no-op.
    fn release(&mut self) -> Result<(), LockError>;

    fn is_held(&self) -> bool;

    /// Mode of the held lock, if any.
    fn mode(&self) -> Option<LockMode>;
}

/// Byte-level key/value partition backing one named cache.
///
/// Writes are durable in the store before the call returns.
pub trait RawPartition: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;
}

/// An open persistent store.
pub trait PersistentStore: Send {
    /// Open (creating if needed) the partition named `name`.
    ///
    /// Repeated calls with the same name return handles on the same data.
    fn partition(&mut self, name: &str) -> Result<Arc<dyn RawPartition>, StorageError>;

    /// Close the store. Partition handles obtained earlier must not be used
    /// afterwards.
    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Creates lock handles and opens stores for a location.
pub trait StoreFactory: Send + Sync {
    /// Build an (unheld) lock handle for `location`.
    fn lock_handle(&self, location: &StoreLocation, poll_interval: Duration) -> Box<dyn LockHandle>;

    /// Open the store at `location`. Callers hold the lock in `mode` first.
    fn open(&self, location: &StoreLocation, mode: LockMode) -> Result<Box<dyn PersistentStore>, StorageError>;
}
