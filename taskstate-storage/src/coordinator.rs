//! Cache access coordinator.
//!
//! Owns the directory lock and the persistent store for one build session and
//! serializes caller threads onto them.
//!
//! ```text
//!   use_cache ──→ wait for owner == None ──→ owner = me ──→ lock held? ──no──→ acquire
//!       │                                                        │
//!       └── owner == me: depth += 1 (no relock)                  └── open store once
//!
//!   scope exit (depth → 0): owner = None; release lock only if nobody is
//!   waiting and either this thread is inside its own long-running operation,
//!   another thread requested a release, or the session is stopping
//! ```
//!
//! The lock is kept across successive callers taking turns, even while other
//! threads run long-running operations. It is given up when a long-running
//! operation starts while nobody owns or waits for the cache (or, failing that,
//! when the current owner's scope ends), and on `stop()`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use taskstate_core::{
    new_session_id, CacheAccessConfig, HeldLock, LockMode, ParallelismMode, SessionError, SessionId,
    SessionState, StorageError, TaskStateError, TaskStateResult, Timestamp,
};
use tracing::{debug, debug_span, info, trace, warn};

use crate::cache::registry::{CacheRegistry, CacheSlot};
use crate::cache::{CacheKey, CacheValue, NamedCache, OverlayStats, ValueSerialization};
use crate::store::{LmdbStoreFactory, LockHandle, PersistentStore, RawPartition, StoreFactory, StoreLocation};

/// The coordinator of the task artifact state cache.
pub type TaskArtifactStateCacheAccess = CacheAccessCoordinator;

/// Counters accumulated over one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessCounters {
    pub lock_acquisitions: u64,
    pub lock_releases: u64,
    pub store_opens: u64,
    /// Cache access scopes entered, nested re-entries included.
    pub scopes_entered: u64,
    /// Entries that had to wait for another thread's scope.
    pub contended_entries: u64,
    pub long_running_operations: u64,
}

/// Point-in-time view of a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub session_id: SessionId,
    pub display_name: String,
    pub state: SessionState,
    pub parallelism: ParallelismMode,
    pub lock_mode: LockMode,
    pub lock_held: bool,
    pub lock_acquired_at: Option<Timestamp>,
    pub store_open: bool,
    pub counters: AccessCounters,
    /// Threads currently inside any scope.
    pub active_threads: usize,
    /// Threads blocked waiting for a cache access scope.
    pub waiting: usize,
    pub started_at: Option<Timestamp>,
    pub caches: Vec<String>,
}

struct AccessState {
    lifecycle: SessionState,
    /// Thread currently inside a cache access scope.
    owner: Option<ThreadId>,
    /// Nesting depth of the owner's cache access scopes.
    depth: usize,
    waiting: usize,
    /// Open long-running operations per thread.
    long_running: HashMap<ThreadId, usize>,
    /// A long-running operation began while another thread owned the scope;
    /// the lock goes once that thread's scope ends with nobody waiting.
    release_requested: bool,
    /// Open scopes of either kind per thread.
    active: HashMap<ThreadId, usize>,
    /// Taken out while an acquisition is in progress.
    lock: Option<Box<dyn LockHandle>>,
    held: Option<HeldLock>,
    store: Option<Box<dyn PersistentStore>>,
    registry: CacheRegistry,
    counters: AccessCounters,
    started_at: Option<Timestamp>,
    contention_warned: bool,
}

impl AccessState {
    fn new(lock: Box<dyn LockHandle>) -> Self {
        Self {
            lifecycle: SessionState::NotStarted,
            owner: None,
            depth: 0,
            waiting: 0,
            long_running: HashMap::new(),
            release_requested: false,
            active: HashMap::new(),
            lock: Some(lock),
            held: None,
            store: None,
            registry: CacheRegistry::default(),
            counters: AccessCounters::default(),
            started_at: None,
            contention_warned: false,
        }
    }

    /// Whether `thread` may open a new scope. While stopping, only threads
    /// already inside a scope may nest further.
    fn admits(&self, thread: ThreadId) -> bool {
        match self.lifecycle {
            SessionState::Running => true,
            SessionState::Stopping => self.active.contains_key(&thread),
            SessionState::NotStarted | SessionState::Stopped => false,
        }
    }

    fn ensure_admits(&self, thread: ThreadId) -> Result<(), SessionError> {
        if self.admits(thread) {
            Ok(())
        } else {
            self.lifecycle.ensure_accepting()
        }
    }

    fn enter_active(&mut self, thread: ThreadId) {
        *self.active.entry(thread).or_insert(0) += 1;
    }

    fn leave_active(&mut self, thread: ThreadId) {
        decrement(&mut self.active, thread);
    }

    fn in_long_running(&self, thread: ThreadId) -> bool {
        self.long_running.contains_key(&thread)
    }
}

fn decrement(counts: &mut HashMap<ThreadId, usize>, thread: ThreadId) {
    if let Some(count) = counts.get_mut(&thread) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&thread);
        }
    }
}

pub(crate) struct Session {
    id: SessionId,
    location: StoreLocation,
    lock_mode: LockMode,
    lock_timeout: Duration,
    parallelism: ParallelismMode,
    factory: Arc<dyn StoreFactory>,
    state: Mutex<AccessState>,
    /// Signalled whenever ownership is given up or a scope ends.
    turn: Condvar,
}

impl Session {
    fn lock_state(&self) -> TaskStateResult<MutexGuard<'_, AccessState>> {
        self.state
            .lock()
            .map_err(|_| TaskStateError::from(StorageError::LockPoisoned))
    }

    fn lock_state_for_exit(&self) -> MutexGuard<'_, AccessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, AccessState>) -> TaskStateResult<MutexGuard<'a, AccessState>> {
        self.turn
            .wait(state)
            .map_err(|_| TaskStateError::from(StorageError::LockPoisoned))
    }

    fn enter_cache_access(&self, operation: &str) -> TaskStateResult<CacheAccessScope<'_>> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;

        if state.owner == Some(me) {
            state.depth += 1;
            state.enter_active(me);
            state.counters.scopes_entered += 1;
            trace!(session = %self.id, operation, depth = state.depth, "re-entered cache access scope");
            return Ok(CacheAccessScope { session: self });
        }

        state.ensure_admits(me)?;
        if state.owner.is_some() {
            state.counters.contended_entries += 1;
            if !self.parallelism.is_parallel() && !state.contention_warned {
                state.contention_warned = true;
                warn!(
                    session = %self.id,
                    operation,
                    "{} used from several threads although the build is serial",
                    self.location.display_name
                );
            }
            state.waiting += 1;
            while state.owner.is_some() && state.admits(me) {
                state = self.wait(state)?;
            }
            state.waiting -= 1;
            if let Err(e) = state.ensure_admits(me) {
                self.release_if_idle(&mut state, me);
                drop(state);
                self.turn.notify_all();
                return Err(e.into());
            }
        }

        state.owner = Some(me);
        state.depth = 1;
        state.enter_active(me);
        // From here on the scope guard unwinds ownership on every exit path.
        let scope = CacheAccessScope { session: self };

        let mut state = match self.ensure_lock_and_store(state) {
            Ok(state) => state,
            Err(e) => {
                warn!(session = %self.id, operation, error = %e, "could not enter cache access scope");
                return Err(e);
            }
        };
        state.counters.scopes_entered += 1;
        debug!(session = %self.id, operation, "entered cache access scope");
        Ok(scope)
    }

    fn exit_cache_access(&self) {
        let me = thread::current().id();
        let mut state = self.lock_state_for_exit();
        state.depth = state.depth.saturating_sub(1);
        state.leave_active(me);
        if state.depth == 0 {
            state.owner = None;
            self.release_if_idle(&mut state, me);
            trace!(session = %self.id, "left cache access scope");
        }
        drop(state);
        self.turn.notify_all();
    }

    fn enter_long_running(&self, operation: &str) -> TaskStateResult<LongRunningScope<'_>> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        state.ensure_admits(me)?;

        let suspended_depth = if state.owner == Some(me) {
            let depth = state.depth;
            state.owner = None;
            state.depth = 0;
            Some(depth)
        } else {
            None
        };

        *state.long_running.entry(me).or_insert(0) += 1;
        state.enter_active(me);
        state.counters.long_running_operations += 1;
        self.release_if_idle(&mut state, me);
        if state.owner.is_some() {
            state.release_requested = true;
        }
        debug!(
            session = %self.id,
            operation,
            suspended = suspended_depth.is_some(),
            lock_held = state.held.is_some(),
            "entered long-running operation"
        );
        drop(state);

        if suspended_depth.is_some() {
            self.turn.notify_all();
        }
        Ok(LongRunningScope {
            session: self,
            suspended_depth,
        })
    }

    fn exit_long_running(&self, suspended_depth: Option<usize>) {
        let me = thread::current().id();
        let mut state = self.lock_state_for_exit();
        decrement(&mut state.long_running, me);
        state.leave_active(me);
        if state.long_running.is_empty() {
            state.release_requested = false;
        }

        if let Some(depth) = suspended_depth {
            // Take the enclosing cache access scope back. The lock is
            // re-acquired on the next cache access, not here.
            state.waiting += 1;
            while state.owner.is_some() {
                state = self.turn.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            state.waiting -= 1;
            state.owner = Some(me);
            state.depth = depth;
        }
        debug!(session = %self.id, "left long-running operation");
        drop(state);
        self.turn.notify_all();
    }

    /// Make sure the lock is held and the store is open. Only the owner calls
    /// this; the state mutex is released while blocking on either.
    fn ensure_lock_and_store<'a>(
        &'a self,
        mut state: MutexGuard<'a, AccessState>,
    ) -> TaskStateResult<MutexGuard<'a, AccessState>> {
        if state.held.is_none() {
            let mut handle = state.lock.take().ok_or(StorageError::Closed)?;
            drop(state);
            let acquired = handle.acquire(self.lock_mode, self.lock_timeout);
            state = self.lock_state_for_exit();
            state.lock = Some(handle);
            let held = acquired?;
            debug!(
                session = %self.id,
                lock = %held.lock_path.display(),
                mode = %held.mode,
                "acquired lock on {}",
                self.location.display_name
            );
            state.counters.lock_acquisitions += 1;
            state.held = Some(held);
        }

        if state.store.is_none() {
            drop(state);
            let opened = self.factory.open(&self.location, self.lock_mode);
            state = self.lock_state_for_exit();
            state.store = Some(opened?);
            state.counters.store_opens += 1;
        }

        Ok(state)
    }

    /// Release the lock if nobody owns or waits for the scope and `thread` is
    /// inside a long-running operation, one was requested meanwhile, or the
    /// session is stopping.
    fn release_if_idle(&self, state: &mut AccessState, thread: ThreadId) {
        let pending =
            state.in_long_running(thread) || state.release_requested || state.lifecycle.is_terminal();
        if state.owner.is_none() && state.waiting == 0 && pending {
            self.release_lock(state);
        }
    }

    fn release_lock(&self, state: &mut AccessState) {
        if state.held.is_none() {
            return;
        }
        let Some(handle) = state.lock.as_mut() else {
            return;
        };
        match handle.release() {
            Ok(()) => {
                if let Some(held) = state.held.take() {
                    debug!(
                        session = %self.id,
                        held_ms = held.held_for(Utc::now()).as_millis() as u64,
                        "released lock on {}",
                        self.location.display_name
                    );
                }
                state.release_requested = false;
                state.counters.lock_releases += 1;
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "failed to release lock on {}", self.location.display_name);
            }
        }
    }

    /// Partition for `slot`, checking the caller is inside a cache access scope.
    pub(crate) fn partition_for<K: CacheKey, V: CacheValue>(
        &self,
        slot: &CacheSlot<K, V>,
    ) -> TaskStateResult<Arc<dyn RawPartition>> {
        let me = thread::current().id();
        let state = self.lock_state()?;
        if state.owner != Some(me) {
            let err = match state.lifecycle {
                SessionState::NotStarted => SessionError::NotStarted,
                SessionState::Stopped => SessionError::AlreadyStopped,
                SessionState::Running | SessionState::Stopping => SessionError::OutsideCacheAccess {
                    cache: slot.name().to_string(),
                },
            };
            return Err(err.into());
        }

        let mut state = self.ensure_lock_and_store(state)?;
        let store = state.store.as_deref_mut().ok_or(StorageError::Closed)?;
        Ok(slot.partition(store)?)
    }

    fn stop(&self) -> TaskStateResult<()> {
        let me = thread::current().id();
        let mut state = self.lock_state()?;
        if state.active.contains_key(&me) {
            return Err(SessionError::StopInsideScope.into());
        }
        state.lifecycle = state.lifecycle.begin_stop()?;
        info!(session = %self.id, "stopping {}", self.location.display_name);

        while !state.active.is_empty() {
            state = self.wait(state)?;
        }

        self.release_lock(&mut state);
        state.registry.detach_all();
        let store = state.store.take();
        state.lifecycle = SessionState::Stopped;
        let counters = state.counters;
        drop(state);
        self.turn.notify_all();

        if let Some(store) = store {
            store.close()?;
        }
        info!(
            session = %self.id,
            lock_acquisitions = counters.lock_acquisitions,
            scopes_entered = counters.scopes_entered,
            contended_entries = counters.contended_entries,
            "stopped {}",
            self.location.display_name
        );
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.lifecycle == SessionState::Running {
            warn!(session = %self.id, "{} dropped without stop()", self.location.display_name);
        }
        state.registry.detach_all();
        if let Some(store) = state.store.take() {
            if let Err(e) = store.close() {
                warn!(session = %self.id, error = %e, "failed to close {}", self.location.display_name);
            }
        }
        if let Some(mut lock) = state.lock.take() {
            if let Err(e) = lock.release() {
                warn!(session = %self.id, error = %e, "failed to release lock on {}", self.location.display_name);
            }
        }
    }
}

#[must_use]
struct CacheAccessScope<'a> {
    session: &'a Session,
}

impl Drop for CacheAccessScope<'_> {
    fn drop(&mut self) {
        self.session.exit_cache_access();
    }
}

#[must_use]
struct LongRunningScope<'a> {
    session: &'a Session,
    suspended_depth: Option<usize>,
}

impl Drop for LongRunningScope<'_> {
    fn drop(&mut self) {
        self.session.exit_long_running(self.suspended_depth);
    }
}

/// Serializes access to one persistent cache across caller threads.
///
/// Cloning yields another handle on the same session.
///
/// # Example
///
/// ```ignore
/// let access = TaskArtifactStateCacheAccess::open(&CacheAccessConfig::task_artifacts(dir, 4))?;
/// let history = access.create_typed_cache::<String, TaskHistory>("taskHistory")?;
/// access.start()?;
///
/// let previous = access.use_cache("load task history", || history.get(&task_path))?;
/// access.long_running_operation("execute task", || run_task(previous))?;
/// access.use_cache("store task history", || history.put(task_path, current))?;
///
/// access.stop()?;
/// ```
#[derive(Clone)]
pub struct CacheAccessCoordinator {
    session: Arc<Session>,
}

impl CacheAccessCoordinator {
    /// Build a coordinator over `factory`. Nothing is locked or opened yet.
    pub fn new(config: &CacheAccessConfig, factory: Arc<dyn StoreFactory>) -> TaskStateResult<Self> {
        config.validate()?;
        let location = StoreLocation::from_config(config);
        let lock = factory.lock_handle(&location, config.lock_poll_interval());
        let session = Session {
            id: new_session_id(),
            location,
            lock_mode: config.lock_mode,
            lock_timeout: config.lock_timeout(),
            parallelism: config.parallelism(),
            factory,
            state: Mutex::new(AccessState::new(lock)),
            turn: Condvar::new(),
        };
        debug!(
            session = %session.id,
            store = %session.location.dir.display(),
            parallelism = %session.parallelism,
            "created coordinator for {}",
            session.location.display_name
        );
        Ok(Self {
            session: Arc::new(session),
        })
    }

    /// Build a coordinator over an LMDB store guarded by a lock file.
    pub fn open(config: &CacheAccessConfig) -> TaskStateResult<Self> {
        Self::new(config, Arc::new(LmdbStoreFactory::from_config(config)))
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn display_name(&self) -> &str {
        &self.session.location.display_name
    }

    pub fn parallelism(&self) -> ParallelismMode {
        self.session.parallelism
    }

    pub fn start(&self) -> TaskStateResult<()> {
        let mut state = self.session.lock_state()?;
        state.lifecycle = state.lifecycle.start()?;
        state.started_at = Some(Utc::now());
        info!(
            session = %self.session.id,
            parallelism = %self.session.parallelism,
            "started {}",
            self.session.location.display_name
        );
        Ok(())
    }

    /// Wait for in-flight scopes, release the lock and close the store.
    pub fn stop(&self) -> TaskStateResult<()> {
        self.session.stop()
    }

    /// Declare a named cache. Does not lock or touch the store.
    pub fn create_cache<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        serialization: ValueSerialization<V>,
    ) -> TaskStateResult<NamedCache<K, V>> {
        let mut state = self.session.lock_state()?;
        if state.lifecycle.is_terminal() {
            return Err(SessionError::AlreadyStopped.into());
        }
        let slot = state.registry.register::<K, V>(name, serialization)?;
        Ok(NamedCache::new(slot, self.session.clone()))
    }

    /// Declare a named cache whose values are serialized by type.
    pub fn create_typed_cache<K, V>(&self, name: &str) -> TaskStateResult<NamedCache<K, V>>
    where
        K: CacheKey,
        V: CacheValue + Serialize + DeserializeOwned,
    {
        self.create_cache(name, ValueSerialization::by_type())
    }

    /// Run `action` inside a cache access scope.
    ///
    /// Errors returned by `action` come back unchanged.
    pub fn use_cache<T, E, F>(&self, operation: &str, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<TaskStateError>,
    {
        let _span = debug_span!("use_cache", operation).entered();
        let _scope = self.session.enter_cache_access(operation).map_err(E::from)?;
        action()
    }

    /// [`use_cache`](Self::use_cache) for actions that cannot fail.
    pub fn use_cache_unit<F: FnOnce()>(&self, operation: &str, action: F) -> TaskStateResult<()> {
        self.use_cache(operation, || {
            action();
            Ok(())
        })
    }

    /// Run `action` without holding the lock.
    ///
    /// A held lock is released first unless another thread is waiting to use
    /// the cache. Called from inside a cache access scope, the scope is
    /// suspended for the duration of `action` and taken back afterwards.
    pub fn long_running_operation<T, E, F>(&self, operation: &str, action: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<TaskStateError>,
    {
        let _span = debug_span!("long_running_operation", operation).entered();
        let _scope = self.session.enter_long_running(operation).map_err(E::from)?;
        action()
    }

    pub fn status(&self) -> TaskStateResult<CoordinatorStatus> {
        let session = &self.session;
        let state = session.lock_state()?;
        Ok(CoordinatorStatus {
            session_id: session.id,
            display_name: session.location.display_name.clone(),
            state: state.lifecycle,
            parallelism: session.parallelism,
            lock_mode: session.lock_mode,
            lock_held: state.held.is_some(),
            lock_acquired_at: state.held.as_ref().map(|held| held.acquired_at),
            store_open: state.store.is_some(),
            counters: state.counters,
            active_threads: state.active.len(),
            waiting: state.waiting,
            started_at: state.started_at,
            caches: state.registry.names(),
        })
    }

    /// Overlay statistics of every declared cache, by name.
    pub fn cache_stats(&self) -> TaskStateResult<Vec<(String, OverlayStats)>> {
        Ok(self.session.lock_state()?.registry.stats())
    }
}

impl std::fmt::Debug for CacheAccessCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAccessCoordinator")
            .field("session_id", &self.session.id)
            .field("display_name", &self.session.location.display_name)
            .field("parallelism", &self.session.parallelism)
            .finish()
    }
}
