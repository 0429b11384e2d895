//! Registry of the named caches declared on one coordinator.
//!
//! Declaring the same name twice with the same key and value types returns
//! the already registered cache. Declaring it with different types fails
//! with [`SessionError::CacheTypeMismatch`].

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use taskstate_core::{SessionError, StorageError};
use tracing::{debug, warn};

use super::codec::{CacheKey, CacheValue, ValueSerialization};
use super::overlay::{InMemoryOverlay, OverlayStats};
use crate::store::{PersistentStore, RawPartition};

/// Everything the coordinator keeps for one named cache.
pub(crate) struct CacheSlot<K, V> {
    name: String,
    by_type: bool,
    overlay: InMemoryOverlay<K, V>,
    /// Opened lazily on first access inside a cache access scope.
    partition: Mutex<Option<Arc<dyn RawPartition>>>,
}

impl<K: CacheKey, V: CacheValue> CacheSlot<K, V> {
    fn new(name: &str, serialization: ValueSerialization<V>) -> Self {
        Self {
            name: name.to_string(),
            by_type: serialization.is_by_type(),
            overlay: InMemoryOverlay::new(name, serialization.codec().clone()),
            partition: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn overlay(&self) -> &InMemoryOverlay<K, V> {
        &self.overlay
    }

    /// Partition handle for this cache, opening it from `store` if needed.
    pub(crate) fn partition(
        &self,
        store: &mut dyn PersistentStore,
    ) -> Result<Arc<dyn RawPartition>, StorageError> {
        let mut slot = self.partition.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(partition) = slot.as_ref() {
            return Ok(partition.clone());
        }
        let partition = store.partition(&self.name)?;
        *slot = Some(partition.clone());
        Ok(partition)
    }
}

/// Type-erased view of a [`CacheSlot`].
pub(crate) trait RegisteredCache: Send + Sync {
    fn name(&self) -> &str;

    /// Drop the partition handle and forget the overlay contents.
    fn detach(&self);

    fn overlay_stats(&self) -> OverlayStats;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: CacheKey, V: CacheValue> RegisteredCache for CacheSlot<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn detach(&self) {
        if let Ok(mut slot) = self.partition.lock() {
            slot.take();
        }
        self.overlay.clear();
    }

    fn overlay_stats(&self) -> OverlayStats {
        self.overlay.stats()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Default)]
pub(crate) struct CacheRegistry {
    caches: BTreeMap<String, Arc<dyn RegisteredCache>>,
}

impl CacheRegistry {
    pub(crate) fn register<K: CacheKey, V: CacheValue>(
        &mut self,
        name: &str,
        serialization: ValueSerialization<V>,
    ) -> Result<Arc<CacheSlot<K, V>>, SessionError> {
        if let Some(existing) = self.caches.get(name) {
            let slot = existing
                .clone()
                .into_any()
                .downcast::<CacheSlot<K, V>>()
                .map_err(|_| SessionError::CacheTypeMismatch {
                    cache: name.to_string(),
                })?;
            if slot.by_type != serialization.is_by_type() {
                warn!(
                    cache = name,
                    first_by_type = slot.by_type,
                    "cache declared again with a different serialization; keeping the first"
                );
            }
            return Ok(slot);
        }

        let slot = Arc::new(CacheSlot::<K, V>::new(name, serialization));
        self.caches.insert(name.to_string(), slot.clone());
        debug!(cache = name, "registered cache");
        Ok(slot)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    pub(crate) fn stats(&self) -> Vec<(String, OverlayStats)> {
        self.caches
            .values()
            .map(|cache| (cache.name().to_string(), cache.overlay_stats()))
            .collect()
    }

    pub(crate) fn detach_all(&self) {
        for cache in self.caches.values() {
            cache.detach();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.caches.len()
    }
}
