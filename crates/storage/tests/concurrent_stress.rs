//! Concurrent access stress tests for `MemoryBackend`.
//!
//! These exercise the access patterns the ticket registry produces under
//! load: many validators racing to consume one ticket, read-modify-write
//! loops on a shared session, and scans running beside writers.
//!
//! ```bash
//! cargo test -p tessera-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use tessera_storage::{
    CasRetryConfig, MemoryBackend, StorageBackend, StorageError, prefix_range,
    testutil::{make_key, make_tagged_value},
    with_cas_retry,
};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of consume rounds for the exactly-one-winner test.
const ROUNDS: usize = 200;

/// Number of operations each task performs in mixed workload tests.
const OPS_PER_TASK: usize = 100;

// ---------------------------------------------------------------------------
// Test: compare_and_delete has exactly one winner per round
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn consume_exactly_one_winner_per_round() {
    let backend = MemoryBackend::new();

    for round in 0..ROUNDS {
        let key = make_key("st", round);
        let value = make_tagged_value(0, round);
        backend
            .set_with_ttl(key.clone(), value.clone(), Duration::from_secs(10))
            .await
            .expect("setup set should succeed");

        let mut set = JoinSet::new();
        for _ in 0..CONCURRENCY {
            let backend = backend.clone();
            let key = key.clone();
            let value = value.clone();
            set.spawn(async move { backend.compare_and_delete(&key, &value).await });
        }

        let mut winners = 0usize;
        while let Some(result) = set.join_next().await {
            match result.expect("task should not panic") {
                Ok(()) => winners += 1,
                Err(StorageError::Conflict) => {},
                Err(e) => panic!("unexpected error in round {round}: {e}"),
            }
        }
        assert_eq!(winners, 1, "round {round}: exactly one consumer should win");
    }
}

// ---------------------------------------------------------------------------
// Test: CAS counter increments are never lost
// ---------------------------------------------------------------------------

/// Each task increments a shared counter through `with_cas_retry`. The final
/// value must equal the total number of increments.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn cas_retry_loses_no_updates() {
    let backend = MemoryBackend::new();
    backend.set(b"counter".to_vec(), b"0".to_vec()).await.expect("seed");
    let config = CasRetryConfig::builder()
        .max_retries(1_000)
        .base_delay(Duration::from_micros(50))
        .build()
        .expect("valid config");

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = backend.clone();
        let config = config.clone();
        set.spawn(async move {
            for _ in 0..OPS_PER_TASK {
                with_cas_retry(&config, || async {
                    let current = backend.get(b"counter").await?.expect("counter exists");
                    let n: usize = std::str::from_utf8(&current)
                        .expect("utf-8")
                        .parse()
                        .expect("numeric counter");
                    backend
                        .compare_and_set(
                            b"counter",
                            Some(&current),
                            (n + 1).to_string().into_bytes(),
                            None,
                        )
                        .await
                })
                .await
                .expect("increment should eventually succeed");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    let value = backend.get(b"counter").await.expect("get").expect("counter exists");
    assert_eq!(value, (CONCURRENCY * OPS_PER_TASK).to_string().as_bytes());
}

// ---------------------------------------------------------------------------
// Test: prefix scans during concurrent writes see only complete entries
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn scans_during_writes_see_well_formed_values() {
    let backend = Arc::new(MemoryBackend::new());
    let scans = Arc::new(AtomicUsize::new(0));

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let backend = Arc::clone(&backend);
        set.spawn(async move {
            for i in 0..OPS_PER_TASK {
                backend
                    .set_with_ttl(
                        make_key("tgt", task_id * OPS_PER_TASK + i),
                        make_tagged_value(task_id, i),
                        Duration::from_secs(30),
                    )
                    .await
                    .expect("set");
            }
        });
    }
    for _ in 0..4 {
        let backend = Arc::clone(&backend);
        let scans = Arc::clone(&scans);
        set.spawn(async move {
            for _ in 0..OPS_PER_TASK {
                for kv in backend.get_range(prefix_range(b"tgt/")).await.expect("scan") {
                    assert!(kv.value.starts_with(b"task"), "torn value: {:?}", kv.value);
                }
                scans.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    assert_eq!(scans.load(Ordering::Relaxed), 4 * OPS_PER_TASK);
    let total = backend.get_range(prefix_range(b"tgt/")).await.expect("scan").len();
    assert_eq!(total, CONCURRENCY * OPS_PER_TASK);
}
