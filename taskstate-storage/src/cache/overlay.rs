//! Write-through in-memory overlay in front of one persistent partition.
//!
//! The overlay remembers both present values and confirmed absences, so a
//! repeated lookup of a missing key does not touch the store again. Writes
//! go to the partition first; the overlay is updated only once the write has
//! succeeded, and a failed write evicts the key so the next read goes back to
//! the store.
//!
//! The overlay itself does not serialize callers. It relies on the
//! coordinator granting cache access to one thread at a time; the internal
//! mutex only keeps the map sound and is never contended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use taskstate_core::StorageError;
use tracing::trace;

use super::codec::{encode_key, CacheKey, CacheValue, CodecError, ValueCodec};
use crate::store::RawPartition;

/// Statistics about overlay usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OverlayStats {
    /// Lookups answered with a remembered value.
    pub hits: u64,
    /// Lookups answered with a remembered absence.
    pub negative_hits: u64,
    /// Lookups that had to read the store.
    pub misses: u64,
    pub writes: u64,
    pub removals: u64,
    /// Keys currently remembered, present or absent.
    pub entry_count: u64,
}

impl OverlayStats {
    /// Fraction of lookups served without touching the store.
    pub fn hit_rate(&self) -> f64 {
        let answered = self.hits + self.negative_hits;
        let total = answered + self.misses;
        if total == 0 {
            0.0
        } else {
            answered as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

/// In-memory view of one named cache.
pub struct InMemoryOverlay<K, V> {
    cache_name: String,
    codec: Arc<dyn ValueCodec<V>>,
    entries: Mutex<HashMap<K, Option<V>>>,
    counters: Counters,
}

impl<K: CacheKey, V: CacheValue> InMemoryOverlay<K, V> {
    pub fn new(cache_name: impl Into<String>, codec: Arc<dyn ValueCodec<V>>) -> Self {
        Self {
            cache_name: cache_name.into(),
            codec,
            entries: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Look up `key`, reading through to `partition` on a miss.
    pub fn get(&self, partition: &dyn RawPartition, key: &K) -> Result<Option<V>, StorageError> {
        if let Some(remembered) = self.entries()?.get(key) {
            let counter = if remembered.is_some() {
                &self.counters.hits
            } else {
                &self.counters.negative_hits
            };
            counter.fetch_add(1, Ordering::Relaxed);
            return Ok(remembered.clone());
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let raw_key = encode_key(key).map_err(|e| self.serialization_error(e))?;
        let value = match partition.get(&raw_key)? {
            Some(bytes) => Some(
                self.codec
                    .decode(&bytes)
                    .map_err(|e| self.deserialization_error(e))?,
            ),
            None => None,
        };
        trace!(cache = %self.cache_name, found = value.is_some(), "overlay miss");

        self.entries()?.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Write `value` through to `partition`, then remember it.
    pub fn put(&self, partition: &dyn RawPartition, key: K, value: V) -> Result<(), StorageError> {
        let raw_key = encode_key(&key).map_err(|e| self.serialization_error(e))?;
        let bytes = self
            .codec
            .encode(&value)
            .map_err(|e| self.serialization_error(e))?;

        if let Err(e) = partition.put(&raw_key, &bytes) {
            self.evict(&key);
            return Err(e);
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.entries()?.insert(key, Some(value));
        Ok(())
    }

    /// Remove `key` from `partition`, then remember the absence.
    pub fn remove(&self, partition: &dyn RawPartition, key: K) -> Result<(), StorageError> {
        let raw_key = encode_key(&key).map_err(|e| self.serialization_error(e))?;

        if let Err(e) = partition.remove(&raw_key) {
            self.evict(&key);
            return Err(e);
        }

        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        self.entries()?.insert(key, None);
        Ok(())
    }

    /// Forget everything remembered. The store is not touched.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> OverlayStats {
        OverlayStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            negative_hits: self.counters.negative_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<K, Option<V>>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn evict(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    fn serialization_error(&self, e: CodecError) -> StorageError {
        StorageError::Serialization {
            cache: self.cache_name.clone(),
            reason: e.0,
        }
    }

    fn deserialization_error(&self, e: CodecError) -> StorageError {
        StorageError::Deserialization {
            cache: self.cache_name.clone(),
            reason: e.0,
        }
    }
}
