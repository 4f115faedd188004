//! Concurrency stress tests for the shared-resource components.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::cache::{CacheConfig, NS_PACK_INFO, PackCache};
use crate::pool::{JobOutcome, WorkerPool};

#[test]
fn cache_survives_concurrent_readers_and_writers() {
    let cache = Arc::new(PackCache::new(CacheConfig {
        memory_capacity_bytes: 64 * 1024,
        ..CacheConfig::default()
    }));

    let mut handles = Vec::new();
    for t in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                let key = format!("key-{}", i % 16);
                if (t + i) % 3 == 0 {
                    cache
                        .set(NS_PACK_INFO, &key, &json!({"t": t, "i": i}), None)
                        .expect("set");
                } else if let Some(v) = cache.get(NS_PACK_INFO, &key) {
                    // Whatever we read must be a complete write, never a
                    // torn value.
                    assert!(v.get("t").is_some());
                    assert!(v.get("i").is_some());
                }
            }
        }));
    }
    for h in handles {
        h.join().expect("thread");
    }

    let stats = cache.stats();
    assert!(stats.hits + stats.misses > 0);
}

#[test]
fn singleflight_under_contention_fetches_once_per_key() {
    let cache = Arc::new(PackCache::new(CacheConfig::default()));
    let fetches = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let fetches = Arc::clone(&fetches);
        handles.push(thread::spawn(move || {
            for key in ["a", "b", "c"] {
                let value = cache
                    .get_or_fetch(NS_PACK_INFO, key, None, || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(json!(key))
                    })
                    .expect("fetch");
                assert_eq!(value, json!(key));
            }
        }));
    }
    for h in handles {
        h.join().expect("thread");
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 3);
}

#[test]
fn pool_handles_burst_submissions_beyond_queue_capacity() {
    let pool = Arc::new(WorkerPool::new(4, 8));
    let completed = Arc::new(AtomicU32::new(0));

    let mut submitters = Vec::new();
    for t in 0..4 {
        let pool = Arc::clone(&pool);
        let completed = Arc::clone(&completed);
        submitters.push(thread::spawn(move || {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    pool.execute(
                        &format!("burst-{t}-{i}"),
                        None,
                        Duration::from_secs(10),
                        |_| {
                            thread::sleep(Duration::from_millis(2));
                            Ok(serde_json::Value::Null)
                        },
                    )
                    .expect("submit")
                })
                .collect();
            for h in handles {
                if h.wait().is_success() {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for s in submitters {
        s.join().expect("submitter");
    }

    assert_eq!(completed.load(Ordering::SeqCst), 64);
    assert_eq!(pool.pending(), 0);
}

#[test]
fn keyed_submissions_from_many_threads_serialize() {
    let pool = Arc::new(WorkerPool::new(8, 32));
    let concurrent = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut submitters = Vec::new();
    for t in 0..8 {
        let pool = Arc::clone(&pool);
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        submitters.push(thread::spawn(move || {
            let handle = pool
                .execute(
                    &format!("writer-{t}"),
                    Some("notes:refs/notes/gitvan/results"),
                    Duration::from_secs(10),
                    move |_| {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(15));
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(serde_json::Value::Null)
                    },
                )
                .expect("submit");
            assert!(matches!(handle.wait(), JobOutcome::Ok(_)));
        }));
    }
    for s in submitters {
        s.join().expect("submitter");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
