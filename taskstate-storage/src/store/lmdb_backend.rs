//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB). One environment per store
//! directory, one named database per partition.
//!
//! # Transactions
//!
//! - Read transactions for `get`
//! - One write transaction per `put`/`remove`, committed before returning
//!
//! A store opened under [`LockMode::Shared`] never creates databases and
//! rejects writes with [`StorageError::ReadOnly`].

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use taskstate_core::{CacheAccessConfig, LockMode, StorageError};
use tracing::{debug, info, warn};

use super::{FileLockHandle, LockHandle, PersistentStore, RawPartition, StoreFactory, StoreLocation};

fn transaction_error(e: heed::Error) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

/// Factory for LMDB stores guarded by an fs2 lock file.
#[derive(Debug, Clone)]
pub struct LmdbStoreFactory {
    map_size_mb: usize,
    max_partitions: u32,
}

impl LmdbStoreFactory {
    pub fn new(map_size_mb: usize, max_partitions: u32) -> Self {
        Self {
            map_size_mb,
            max_partitions,
        }
    }

    pub fn from_config(config: &CacheAccessConfig) -> Self {
        Self::new(config.map_size_mb, config.max_partitions)
    }
}

impl Default for LmdbStoreFactory {
    fn default() -> Self {
        Self::from_config(&CacheAccessConfig::default())
    }
}

impl StoreFactory for LmdbStoreFactory {
    fn lock_handle(&self, location: &StoreLocation, poll_interval: Duration) -> Box<dyn LockHandle> {
        Box::new(FileLockHandle::new(
            location.lock_path(),
            &location.display_name,
            poll_interval,
        ))
    }

    fn open(&self, location: &StoreLocation, mode: LockMode) -> Result<Box<dyn PersistentStore>, StorageError> {
        let store = LmdbStore::open(location, mode, self.map_size_mb, self.max_partitions)?;
        Ok(Box::new(store))
    }
}

/// An open LMDB environment.
pub struct LmdbStore {
    env: Env,
    name: String,
    mode: LockMode,
    partitions: HashMap<String, Arc<LmdbPartition>>,
}

impl LmdbStore {
    /// Open (creating if needed) the environment in `location.dir`.
    pub fn open(
        location: &StoreLocation,
        mode: LockMode,
        map_size_mb: usize,
        max_partitions: u32,
    ) -> Result<Self, StorageError> {
        let open_error = |reason: String| StorageError::Open {
            name: location.display_name.clone(),
            reason,
        };

        fs::create_dir_all(&location.dir).map_err(|e| open_error(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(max_partitions)
                .open(&location.dir)
        }
        .map_err(|e| open_error(e.to_string()))?;

        info!(
            store = %location.dir.display(),
            mode = %mode,
            "opened {}",
            location.display_name
        );

        Ok(Self {
            env,
            name: location.name.clone(),
            mode,
            partitions: HashMap::new(),
        })
    }

    fn open_database(&self, name: &str) -> Result<Option<Database<Bytes, Bytes>>, StorageError> {
        if self.mode.allows_writes() {
            let mut wtxn = self.env.write_txn().map_err(transaction_error)?;
            let db: Database<Bytes, Bytes> = self
                .env
                .create_database(&mut wtxn, Some(name))
                .map_err(transaction_error)?;
            wtxn.commit().map_err(transaction_error)?;
            Ok(Some(db))
        } else {
            let rtxn = self.env.read_txn().map_err(transaction_error)?;
            let db: Option<Database<Bytes, Bytes>> = self
                .env
                .open_database(&rtxn, Some(name))
                .map_err(transaction_error)?;
            rtxn.commit().map_err(transaction_error)?;
            Ok(db)
        }
    }
}

impl PersistentStore for LmdbStore {
    fn partition(&mut self, name: &str) -> Result<Arc<dyn RawPartition>, StorageError> {
        if let Some(existing) = self.partitions.get(name) {
            return Ok(existing.clone());
        }

        let db = self.open_database(name)?;
        debug!(store = %self.name, partition = name, exists = db.is_some(), "opened partition");

        let partition = Arc::new(LmdbPartition {
            env: self.env.clone(),
            db,
            name: name.to_string(),
            writable: self.mode.allows_writes(),
        });
        self.partitions.insert(name.to_string(), partition.clone());
        Ok(partition)
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        let LmdbStore {
            env,
            name,
            partitions,
            ..
        } = *self;
        let partition_count = partitions.len();
        drop(partitions);
        if let Err(e) = env.force_sync() {
            warn!(store = %name, error = %e, "sync on close failed");
        }
        drop(env);
        info!(store = %name, partition_count, "closed store");
        Ok(())
    }
}

/// One named LMDB database.
pub struct LmdbPartition {
    env: Env,
    /// `None` when opened read-only and the database was never created.
    db: Option<Database<Bytes, Bytes>>,
    name: String,
    writable: bool,
}

impl LmdbPartition {
    fn writable_db(&self) -> Result<Database<Bytes, Bytes>, StorageError> {
        match self.db {
            Some(db) if self.writable => Ok(db),
            _ => Err(StorageError::ReadOnly {
                cache: self.name.clone(),
            }),
        }
    }
}

impl RawPartition for LmdbPartition {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(db) = self.db else {
            return Ok(None);
        };
        let rtxn = self.env.read_txn().map_err(transaction_error)?;
        let value = db.get(&rtxn, key).map_err(transaction_error)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let db = self.writable_db()?;
        let mut wtxn = self.env.write_txn().map_err(transaction_error)?;
        db.put(&mut wtxn, key, value).map_err(transaction_error)?;
        wtxn.commit().map_err(transaction_error)
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        let db = self.writable_db()?;
        let mut wtxn = self.env.write_txn().map_err(transaction_error)?;
        db.delete(&mut wtxn, key).map_err(transaction_error)?;
        wtxn.commit().map_err(transaction_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location(dir: &TempDir) -> StoreLocation {
        StoreLocation::new(dir.path().join("taskArtifacts"), "taskArtifacts", "task artifact state cache")
    }

    fn open_store(dir: &TempDir, mode: LockMode) -> Box<dyn PersistentStore> {
        LmdbStoreFactory::new(10, 8)
            .open(&location(dir), mode)
            .expect("store open should succeed")
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let mut store = open_store(&dir, LockMode::Exclusive);
        let partition = store.partition("tasks").expect("partition should open");

        partition.put(b"k", b"v").expect("put should succeed");
        assert_eq!(partition.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(partition.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let mut store = open_store(&dir, LockMode::Exclusive);
        let partition = store.partition("tasks").unwrap();

        partition.put(b"k", b"v").unwrap();
        partition.remove(b"k").unwrap();
        assert_eq!(partition.get(b"k").unwrap(), None);
        // Removing an absent key is not an error
        partition.remove(b"k").unwrap();
    }

    #[test]
    fn test_partitions_are_isolated() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let mut store = open_store(&dir, LockMode::Exclusive);
        let a = store.partition("a").unwrap();
        let b = store.partition("b").unwrap();

        a.put(b"k", b"from-a").unwrap();
        assert_eq!(b.get(b"k").unwrap(), None);
        assert_eq!(store.partition("a").unwrap().get(b"k").unwrap(), Some(b"from-a".to_vec()));
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let mut store = open_store(&dir, LockMode::Exclusive);
            store.partition("tasks").unwrap().put(b"k", b"v").unwrap();
            store.close().expect("close should succeed");
        }
        let mut store = open_store(&dir, LockMode::Exclusive);
        assert_eq!(store.partition("tasks").unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_shared_mode_is_read_only() {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let mut store = open_store(&dir, LockMode::Exclusive);
            store.partition("tasks").unwrap().put(b"k", b"v").unwrap();
            store.close().unwrap();
        }
        let mut store = open_store(&dir, LockMode::Shared);
        let tasks = store.partition("tasks").unwrap();
        assert_eq!(tasks.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(matches!(
            tasks.put(b"k", b"w"),
            Err(StorageError::ReadOnly { .. })
        ));

        let never_created = store.partition("other").unwrap();
        assert_eq!(never_created.get(b"k").unwrap(), None);
        assert!(never_created.remove(b"k").is_err());
    }
}
