//! Typed handle on one named cache.

use std::fmt;
use std::sync::Arc;

use taskstate_core::TaskStateResult;

use super::codec::{CacheKey, CacheValue};
use super::overlay::OverlayStats;
use super::registry::CacheSlot;
use crate::coordinator::Session;

/// A named cache obtained from
/// [`CacheAccessCoordinator::create_cache`](crate::CacheAccessCoordinator::create_cache).
///
/// Reads and writes must happen inside a cache access scope of the
/// coordinator that created the handle; elsewhere they fail with
/// `SessionError::OutsideCacheAccess`. Handles for the same name share one
/// overlay.
pub struct NamedCache<K, V> {
    slot: Arc<CacheSlot<K, V>>,
    session: Arc<Session>,
}

impl<K: CacheKey, V: CacheValue> NamedCache<K, V> {
    pub(crate) fn new(slot: Arc<CacheSlot<K, V>>, session: Arc<Session>) -> Self {
        Self { slot, session }
    }

    pub fn name(&self) -> &str {
        self.slot.name()
    }

    pub fn get(&self, key: &K) -> TaskStateResult<Option<V>> {
        let partition = self.session.partition_for(&*self.slot)?;
        Ok(self.slot.overlay().get(partition.as_ref(), key)?)
    }

    /// Store `value`. The write is durable when this returns.
    pub fn put(&self, key: K, value: V) -> TaskStateResult<()> {
        let partition = self.session.partition_for(&*self.slot)?;
        Ok(self.slot.overlay().put(partition.as_ref(), key, value)?)
    }

    pub fn remove(&self, key: K) -> TaskStateResult<()> {
        let partition = self.session.partition_for(&*self.slot)?;
        Ok(self.slot.overlay().remove(partition.as_ref(), key)?)
    }

    /// Overlay statistics. Readable outside a scope.
    pub fn stats(&self) -> OverlayStats {
        self.slot.overlay().stats()
    }

    /// Whether both handles refer to the same registered cache.
    pub fn same_cache(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<K, V> Clone for NamedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            session: self.session.clone(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for NamedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedCache").field("name", &self.name()).finish()
    }
}
