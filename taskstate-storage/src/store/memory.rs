//! In-memory persistent store for testing.
//!
//! Data lives in the factory and survives store close/reopen, so several
//! coordinator sessions over one factory behave like sessions over one
//! directory. The lock is modelled in-process with the same exclusive/shared
//! semantics as the file lock.
//!
//! Every partition access goes through an occupancy probe that records the
//! highest number of threads ever inside the store at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskstate_core::{HeldLock, LockError, LockMode, StorageError};

use super::{LockHandle, PersistentStore, RawPartition, StoreFactory, StoreLocation};

type PartitionData = Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>;

/// Counters exposed by [`MemoryStoreFactory::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub opens: u64,
    pub closes: u64,
    pub reads: u64,
    pub writes: u64,
    pub lock_acquisitions: u64,
    pub lock_releases: u64,
    /// Highest number of threads observed inside partition operations at once.
    pub max_concurrent_access: usize,
}

#[derive(Default)]
struct LockTable {
    next_handle: u64,
    holders: HashMap<u64, LockMode>,
}

impl LockTable {
    fn compatible(&self, handle: u64, mode: LockMode) -> bool {
        self.holders.iter().all(|(id, held)| {
            *id == handle || (mode == LockMode::Shared && *held == LockMode::Shared)
        })
    }
}

#[derive(Default)]
struct MemoryInner {
    partitions: Mutex<HashMap<String, PartitionData>>,
    locks: Mutex<LockTable>,
    lock_released: Condvar,
    opens: AtomicU64,
    closes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    lock_acquisitions: AtomicU64,
    lock_releases: AtomicU64,
    occupancy: AtomicUsize,
    max_occupancy: AtomicUsize,
    access_delay_us: AtomicU64,
    fail_next_write: AtomicBool,
}

impl MemoryInner {
    fn enter(&self) -> Occupant<'_> {
        let now = self.occupancy.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_occupancy.fetch_max(now, Ordering::SeqCst);
        let delay = self.access_delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        Occupant { inner: self }
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Occupant<'a> {
    inner: &'a MemoryInner,
}

impl Drop for Occupant<'_> {
    fn drop(&mut self) {
        self.inner.occupancy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Factory for in-memory stores. Clones share data, locks and counters.
#[derive(Clone, Default)]
pub struct MemoryStoreFactory {
    inner: Arc<MemoryInner>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every partition operation.
    ///
    /// Widens the window in which overlapping access would be observed.
    pub fn set_access_delay(&self, delay: Duration) {
        self.inner
            .access_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Make the next `put` or `remove` fail with a transaction error.
    pub fn fail_next_write(&self) {
        self.inner.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Read a stored value directly, bypassing any coordinator.
    pub fn raw_get(&self, partition: &str, key: &[u8]) -> Option<Vec<u8>> {
        let partitions = self.inner.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let data = partitions.get(partition)?;
        let data = data.read().unwrap_or_else(|e| e.into_inner());
        data.get(key).cloned()
    }

    /// Number of entries stored in a partition.
    pub fn partition_len(&self, partition: &str) -> usize {
        let partitions = self.inner.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .get(partition)
            .map(|data| data.read().map(|d| d.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether any handle currently holds the lock.
    pub fn is_locked(&self) -> bool {
        !self.inner.lock_table().holders.is_empty()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let inner = &self.inner;
        MemoryStoreStats {
            opens: inner.opens.load(Ordering::SeqCst),
            closes: inner.closes.load(Ordering::SeqCst),
            reads: inner.reads.load(Ordering::SeqCst),
            writes: inner.writes.load(Ordering::SeqCst),
            lock_acquisitions: inner.lock_acquisitions.load(Ordering::SeqCst),
            lock_releases: inner.lock_releases.load(Ordering::SeqCst),
            max_concurrent_access: inner.max_occupancy.load(Ordering::SeqCst),
        }
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn lock_handle(&self, location: &StoreLocation, poll_interval: Duration) -> Box<dyn LockHandle> {
        let id = {
            let mut table = self.inner.lock_table();
            table.next_handle += 1;
            table.next_handle
        };
        Box::new(MemoryLockHandle {
            inner: self.inner.clone(),
            id,
            lock_path: location.lock_path(),
            display_name: location.display_name.clone(),
            poll_interval,
            held: None,
        })
    }

    fn open(&self, location: &StoreLocation, mode: LockMode) -> Result<Box<dyn PersistentStore>, StorageError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStore {
            inner: self.inner.clone(),
            name: location.name.clone(),
            writable: mode.allows_writes(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// In-process stand-in for the directory lock.
pub struct MemoryLockHandle {
    inner: Arc<MemoryInner>,
    id: u64,
    lock_path: PathBuf,
    display_name: String,
    poll_interval: Duration,
    held: Option<HeldLock>,
}

impl LockHandle for MemoryLockHandle {
    fn acquire(&mut self, mode: LockMode, timeout: Duration) -> Result<HeldLock, LockError> {
        if let Some(held) = &self.held {
            if held.mode == mode {
                return Ok(held.clone());
            }
            self.release()?;
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut table = self.inner.lock_table();
        while !table.compatible(self.id, mode) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    display_name: self.display_name.clone(),
                    lock_path: self.lock_path.clone(),
                    waited: started.elapsed(),
                });
            }
            let wait = self.poll_interval.min(deadline - now);
            table = match self.inner.lock_released.wait_timeout(table, wait) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        table.holders.insert(self.id, mode);
        drop(table);

        self.inner.lock_acquisitions.fetch_add(1, Ordering::SeqCst);
        let held = HeldLock::new(&self.lock_path, mode, Utc::now());
        self.held = Some(held.clone());
        Ok(held)
    }

    fn release(&mut self) -> Result<(), LockError> {
        if self.held.take().is_none() {
            return Ok(());
        }
        self.inner.lock_table().holders.remove(&self.id);
        self.inner.lock_releases.fetch_add(1, Ordering::SeqCst);
        self.inner.lock_released.notify_all();
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }

    fn mode(&self) -> Option<LockMode> {
        self.held.as_ref().map(|held| held.mode)
    }
}

impl Drop for MemoryLockHandle {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

struct MemoryStore {
    inner: Arc<MemoryInner>,
    name: String,
    writable: bool,
    closed: Arc<AtomicBool>,
}

impl PersistentStore for MemoryStore {
    fn partition(&mut self, name: &str) -> Result<Arc<dyn RawPartition>, StorageError> {
        let data = {
            let mut partitions = self
                .inner
                .partitions
                .lock()
                .map_err(|_| StorageError::LockPoisoned)?;
            partitions.entry(name.to_string()).or_default().clone()
        };
        Ok(Arc::new(MemoryPartition {
            inner: self.inner.clone(),
            data,
            name: name.to_string(),
            writable: self.writable,
            closed: self.closed.clone(),
        }))
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(store = %self.name, "closed in-memory store");
        Ok(())
    }
}

struct MemoryPartition {
    inner: Arc<MemoryInner>,
    data: PartitionData,
    name: String,
    writable: bool,
    closed: Arc<AtomicBool>,
}

impl MemoryPartition {
    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StorageError> {
        self.check_open()?;
        if !self.writable {
            return Err(StorageError::ReadOnly {
                cache: self.name.clone(),
            });
        }
        if self.inner.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Transaction {
                reason: format!("injected write failure in partition '{}'", self.name),
            });
        }
        Ok(())
    }
}

impl RawPartition for MemoryPartition {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        let _occupant = self.inner.enter();
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let _occupant = self.inner.enter();
        self.check_write()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        let _occupant = self.inner.enter();
        self.check_write()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        data.remove(key);
        Ok(())
    }
}
