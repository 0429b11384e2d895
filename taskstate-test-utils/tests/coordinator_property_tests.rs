//! Property Tests for the Cache Access Coordinator
//!
//! Properties exercised over the in-memory store:
//! - At most one thread is inside the store at any time
//! - The lock is acquired once for many successive scopes
//! - Nested scopes neither deadlock nor relock
//! - Long-running operations give the lock up and it is taken back on demand
//! - Writes reach the store before the scope ends
//! - stop() releases the lock and closes the store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use taskstate_test_utils::generators::{arb_cache_ops, CacheOp};
use taskstate_test_utils::{assertions, fixtures, init_test_tracing};
use taskstate_test_utils::{SessionError, TaskStateError, TaskStateResult};

#[derive(Debug, PartialEq)]
enum BuildError {
    TaskFailed(String),
    Cache(TaskStateError),
}

impl From<TaskStateError> for BuildError {
    fn from(e: TaskStateError) -> Self {
        BuildError::Cache(e)
    }
}

fn key(name: &str) -> String {
    name.to_string()
}

// ============================================================================
// MUTUAL EXCLUSION
// ============================================================================

#[test]
fn test_parallel_workers_never_overlap_in_store() {
    init_test_tracing();
    let (access, factory) = fixtures::started_memory_coordinator(8);
    factory.set_access_delay(Duration::from_micros(200));
    let cache = access.create_typed_cache::<String, u64>("taskHistory").unwrap();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8u64)
        .map(|worker| {
            let access = access.clone();
            let cache = cache.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for round in 0..20u64 {
                    access
                        .use_cache("execute task", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            let k = format!(":task{}", worker);
                            let previous = cache.get(&k)?;
                            cache.put(k, previous.unwrap_or(0) + round)?;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, TaskStateError>(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assertions::assert_serialized_access(&factory);
    for worker in 0..8u64 {
        let total = access
            .use_cache("check", || cache.get(&format!(":task{}", worker)))
            .unwrap();
        assert_eq!(total, Some((0..20).sum()));
    }
    access.stop().unwrap();
}

#[test]
fn test_two_threads_write_distinct_keys() {
    let (access, factory) = fixtures::started_memory_coordinator(2);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    let writers: Vec<_> = [("a", 1u64), ("b", 2u64)]
        .into_iter()
        .map(|(k, v)| {
            let access = access.clone();
            let cache = cache.clone();
            thread::spawn(move || access.use_cache("write", || cache.put(key(k), v)))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap().unwrap();
    }

    let (a, b) = access
        .use_cache("read", || Ok::<_, TaskStateError>((cache.get(&key("a"))?, cache.get(&key("b"))?)))
        .unwrap();
    assert_eq!(a, Some(1));
    assert_eq!(b, Some(2));
    assertions::assert_serialized_access(&factory);
    access.stop().unwrap();
}

// ============================================================================
// LOCK LIFECYCLE
// ============================================================================

#[test]
fn test_successive_scopes_lock_once() {
    let (access, factory) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();
    assert!(!factory.is_locked());

    for i in 0..50 {
        access.use_cache("write", || cache.put(key("n"), i)).unwrap();
    }

    let stats = factory.stats();
    assert_eq!(stats.lock_acquisitions, 1);
    assert_eq!(stats.opens, 1);
    assert!(factory.is_locked());
    access.stop().unwrap();
}

#[test]
fn test_nested_scopes_do_not_relock() {
    let (access, factory) = fixtures::started_memory_coordinator(4);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    let value = access
        .use_cache("outer", || {
            cache.put(key("x"), 1)?;
            access.use_cache("inner", || {
                let seen = cache.get(&key("x"))?;
                access.use_cache("innermost", || cache.put(key("x"), seen.unwrap_or(0) + 1))?;
                cache.get(&key("x"))
            })
        })
        .unwrap();

    assert_eq!(value, Some(2));
    assert_eq!(factory.stats().lock_acquisitions, 1);
    let status = access.status().unwrap();
    assert_eq!(status.counters.scopes_entered, 3);
    access.stop().unwrap();
}

#[test]
fn test_long_running_operation_releases_lock() {
    let (access, factory) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();
    access.use_cache("before", || cache.put(key("k"), 1)).unwrap();
    assert!(factory.is_locked());

    let locked_during = access
        .long_running_operation("compile", || Ok::<_, TaskStateError>(factory.is_locked()))
        .unwrap();
    assert!(!locked_during);
    assertions::assert_unlocked(&factory);

    let value = access.use_cache("after", || cache.get(&key("k"))).unwrap();
    assert_eq!(value, Some(1));
    let stats = factory.stats();
    assert_eq!(stats.lock_acquisitions, 2);
    assert_eq!(stats.lock_releases, 1);
    access.stop().unwrap();
}

#[test]
fn test_long_running_inside_scope_suspends_and_resumes() {
    let (access, factory) = fixtures::started_memory_coordinator(2);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    let other = {
        let access = access.clone();
        let cache = cache.clone();
        let factory = factory.clone();
        move || {
            access.use_cache("other worker", || {
                assert!(factory.is_locked());
                cache.put(key("other"), 9)
            })
        }
    };

    let result = access.use_cache("task", || {
        cache.put(key("mine"), 1)?;
        access.long_running_operation("external process", || {
            thread::spawn(other.clone()).join().unwrap()
        })?;
        cache.get(&key("other"))
    });

    assert_eq!(result.unwrap(), Some(9));
    assertions::assert_serialized_access(&factory);
    access.stop().unwrap();
}

// ============================================================================
// WRITE-THROUGH AND ERRORS
// ============================================================================

#[test]
fn test_writes_reach_store_before_scope_ends() {
    let (access, factory) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    access
        .use_cache("write", || {
            cache.put(key("a"), 42)?;
            assert_eq!(factory.raw_get("tasks", b"\"a\""), Some(b"42".to_vec()));
            Ok::<_, TaskStateError>(())
        })
        .unwrap();
    assert_eq!(factory.partition_len("tasks"), 1);
    access.stop().unwrap();
}

#[test]
fn test_failed_action_is_rethrown_and_next_scope_succeeds() {
    let (access, factory) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    let failed: Result<(), BuildError> = access.use_cache("broken task", || {
        cache.put(key("partial"), 1)?;
        Err(BuildError::TaskFailed("compilation failed".to_string()))
    });
    assert_eq!(failed, Err(BuildError::TaskFailed("compilation failed".to_string())));

    let value = access.use_cache("next task", || cache.get(&key("partial"))).unwrap();
    assert_eq!(value, Some(1));
    assert_eq!(factory.stats().lock_acquisitions, 1);
    access.stop().unwrap();
}

#[test]
fn test_failed_store_write_surfaces_as_storage_error() {
    let (access, factory) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();
    factory.fail_next_write();

    let result = access.use_cache("write", || cache.put(key("a"), 1));
    assertions::assert_storage_error(&result);

    let value = access.use_cache("read", || cache.get(&key("a"))).unwrap();
    assert_eq!(value, None);
    access.stop().unwrap();
}

#[test]
fn test_cache_use_outside_scope_is_rejected() {
    let (access, _) = fixtures::started_memory_coordinator(0);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();

    assertions::assert_session_error(
        &cache.get(&key("a")),
        SessionError::OutsideCacheAccess {
            cache: "tasks".to_string(),
        },
    );
    access.stop().unwrap();
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn test_stop_releases_lock_and_closes_store() {
    let (access, factory) = fixtures::started_memory_coordinator(2);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();
    access.use_cache("write", || cache.put(key("a"), 1)).unwrap();

    access.stop().unwrap();

    assertions::assert_unlocked(&factory);
    assert_eq!(factory.stats().closes, 1);
    assertions::assert_session_error(
        &access.use_cache("late", || cache.get(&key("a"))),
        SessionError::AlreadyStopped,
    );
}

#[test]
fn test_stop_waits_for_running_scope() {
    let (access, factory) = fixtures::started_memory_coordinator(2);
    let cache = access.create_typed_cache::<String, u64>("tasks").unwrap();
    let entered = Arc::new(Barrier::new(2));

    let worker = {
        let access = access.clone();
        let cache = cache.clone();
        let entered = entered.clone();
        thread::spawn(move || {
            access.use_cache("slow task", || {
                entered.wait();
                thread::sleep(Duration::from_millis(50));
                cache.put(key("slow"), 5)
            })
        })
    };

    entered.wait();
    access.stop().unwrap();
    worker.join().unwrap().unwrap();

    assert_eq!(factory.raw_get("tasks", b"\"slow\""), Some(b"5".to_vec()));
    assertions::assert_unlocked(&factory);
}

#[test]
fn test_stop_from_inside_scope_is_rejected() {
    let (access, _) = fixtures::started_memory_coordinator(0);
    let result: TaskStateResult<()> = access.use_cache("task", || access.stop());
    assertions::assert_session_error(&result, SessionError::StopInsideScope);
    access.stop().unwrap();
}

// ============================================================================
// MODEL-BASED
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// A cache driven through the coordinator agrees with a map, and a later
    /// session over the same store sees the final contents.
    #[test]
    fn prop_cache_matches_model_across_sessions(ops in arb_cache_ops(40)) {
        let (access, factory) = fixtures::started_memory_coordinator(0);
        let cache = access.create_typed_cache::<String, u64>("model").unwrap();
        let mut model: HashMap<String, u64> = HashMap::new();

        for op in &ops {
            match op {
                CacheOp::Put(k, v) => {
                    access.use_cache("put", || cache.put(k.clone(), *v)).unwrap();
                    model.insert(k.clone(), *v);
                }
                CacheOp::Get(k) => {
                    let got = access.use_cache("get", || cache.get(k)).unwrap();
                    prop_assert_eq!(got, model.get(k).copied());
                }
                CacheOp::Remove(k) => {
                    access.use_cache("remove", || cache.remove(k.clone())).unwrap();
                    model.remove(k);
                }
            }
        }
        access.stop().unwrap();
        prop_assert_eq!(factory.partition_len("model"), model.len());

        let (next, _) = fixtures::coordinator_over(&fixtures::memory_config(0), &factory);
        next.start().unwrap();
        let cache = next.create_typed_cache::<String, u64>("model").unwrap();
        for (k, v) in &model {
            let got = next.use_cache("verify", || cache.get(k)).unwrap();
            prop_assert_eq!(got, Some(*v));
        }
        next.stop().unwrap();
    }
}
