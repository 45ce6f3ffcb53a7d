#![allow(clippy::expect_used, clippy::panic)]
//! Fail-point injection in the retry loops.
//!
//! Requires the `failpoints` feature:
//! ```bash
//! cargo test -p tessera-storage --features failpoints --test failpoint_tests
//! ```

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use tessera_storage::{
    CasRetryConfig, RetryConfig, StorageError, StorageResult, with_cas_retry, with_retry_timeout,
};

fn fast_retry() -> RetryConfig {
    RetryConfig::builder()
        .max_retries(3)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build()
        .expect("valid config")
}

#[tokio::test]
async fn pause_before_backoff_sleep_trips_deadline() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("retry-before-sleep", "sleep(200)").expect("failed to configure fail point");

    let result: StorageResult<()> =
        with_retry_timeout(&fast_retry(), Duration::from_millis(50), None, "get", || async {
            Err(StorageError::connection("refused"))
        })
        .await;

    match result {
        Err(StorageError::Timeout { context: Some(ctx) }) => {
            assert!(ctx.attempts_completed >= 1);
            assert!(ctx.last_error.is_some());
        },
        other => panic!("expected timeout with context, got {other:?}"),
    }

    scenario.teardown();
}

#[tokio::test]
async fn retry_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let calls = AtomicU32::new(0);

    let result = with_retry_timeout(&fast_retry(), Duration::from_secs(2), None, "get", || {
        let n = calls.fetch_add(1, Ordering::Relaxed);
        async move { if n == 0 { Err(StorageError::connection("blip")) } else { Ok(n) } }
    })
    .await;

    assert_eq!(result.expect("second attempt succeeds"), 1);
    scenario.teardown();
}

#[tokio::test]
async fn cas_retry_failpoint_panics_are_observable() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("cas-retry-before-sleep", "panic").expect("failed to configure fail point");

    let handle = tokio::spawn(async {
        let config = CasRetryConfig::default();
        let _: StorageResult<()> =
            with_cas_retry(&config, || async { Err(StorageError::conflict()) }).await;
    });
    assert!(handle.await.is_err(), "fail point should abort the CAS retry loop");

    scenario.teardown();
}
