//! Retry helpers for transient failures and compare-and-set contention.
//!
//! - [`with_retry_timeout`] replays an operation on transient errors
//!   ([`StorageError::is_transient`]) with exponential backoff, and bounds the whole loop by a
//!   deadline.
//! - [`with_cas_retry`] restarts a read-modify-write closure when it loses a compare-and-set race.
//!
//! # Backoff Strategy
//!
//! `min(initial_backoff * 2^attempt, max_backoff)` plus 0–50% random jitter,
//! so that many callers failing together do not retry in lockstep.

use std::{future::Future, sync::Arc, time::Duration};

use fail::fail_point;
use parking_lot::Mutex;
use rand::Rng;

use crate::{
    config::{CasRetryConfig, RetryConfig},
    error::{StorageError, StorageResult, TimeoutContext},
    metrics::Metrics,
};

/// Progress of a retry loop, shared with the deadline handler.
#[derive(Debug, Default)]
struct Progress {
    attempts_completed: u32,
    during_backoff: bool,
    // `StorageError` is not `Clone`, so only its rendering is kept.
    last_error: Option<String>,
}

/// Runs `operation` with transient-error retry, bounded by `timeout`.
///
/// Non-transient errors are returned on first sight. When the deadline
/// fires the returned [`StorageError::Timeout`] carries a
/// [`TimeoutContext`] describing how far the loop got.
///
/// # Errors
///
/// Returns the operation's last error once retries are exhausted, the
/// first non-transient error, or a timeout.
#[tracing::instrument(
    skip(config, metrics, operation),
    fields(timeout_ms = timeout.as_millis() as u64, max_retries = config.max_retries)
)]
pub async fn with_retry_timeout<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    metrics: Option<&Metrics>,
    operation_name: &str,
    operation: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let progress = Arc::new(Mutex::new(Progress::default()));
    let tracked = retry_tracked(config, metrics, operation_name, operation, Arc::clone(&progress));

    match tokio::time::timeout(timeout, tracked).await {
        Ok(result) => result,
        Err(_elapsed) => {
            if let Some(m) = metrics {
                m.record_timeout();
            }
            let p = progress.lock();
            tracing::debug!(
                operation = operation_name,
                attempts = p.attempts_completed,
                during_backoff = p.during_backoff,
                "operation deadline elapsed",
            );
            Err(StorageError::timeout_with_context(TimeoutContext {
                attempts_completed: p.attempts_completed,
                during_backoff: p.during_backoff,
                last_error: p
                    .last_error
                    .as_ref()
                    .map(|detail| Box::new(StorageError::internal(detail.clone()))),
            }))
        },
    }
}

async fn retry_tracked<F, Fut, T>(
    config: &RetryConfig,
    metrics: Option<&Metrics>,
    operation_name: &str,
    mut operation: F,
    progress: Arc<Mutex<Progress>>,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        progress.lock().during_backoff = false;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        {
            let mut p = progress.lock();
            p.attempts_completed = attempt + 1;
            p.last_error = Some(err.detail());
        }

        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= config.max_retries {
            if attempt > 0
                && let Some(m) = metrics
            {
                m.record_retry_exhausted();
            }
            return Err(err);
        }

        if let Some(m) = metrics {
            m.record_retry();
        }
        let delay = compute_backoff(config, attempt);
        tracing::debug!(
            operation = operation_name,
            attempt = attempt + 1,
            max_attempts = config.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient error, retrying after backoff",
        );
        fail_point!("retry-before-sleep");
        progress.lock().during_backoff = true;
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Restarts a read-modify-write cycle on [`StorageError::Conflict`].
///
/// `operation` must perform the whole cycle (read, compute, conditional
/// write) so that each restart observes fresh state. Other errors are
/// returned immediately.
///
/// # Errors
///
/// Returns [`StorageError::CasRetriesExhausted`] when every attempt
/// conflicts, or the first non-conflict error.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub async fn with_cas_retry<F, Fut, T>(config: &CasRetryConfig, mut operation: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(StorageError::Conflict) if attempt < config.max_retries => {
                let delay = cas_delay(config);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_us = delay.as_micros() as u64,
                    "CAS conflict, retrying after jitter",
                );
                fail_point!("cas-retry-before-sleep");
                tokio::time::sleep(delay).await;
            },
            Err(StorageError::Conflict) => break,
            Err(e) => return Err(e),
        }
    }

    Err(StorageError::cas_retries_exhausted(config.max_retries + 1))
}

fn cas_delay(config: &CasRetryConfig) -> Duration {
    let range = u64::try_from(config.base_delay.as_micros()).unwrap_or(u64::MAX);
    if range == 0 {
        return Duration::ZERO;
    }
    config.base_delay + Duration::from_micros(rand::rng().random_range(0..=range))
}

/// Backoff for the given zero-based attempt.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let capped = config.initial_backoff.saturating_mul(factor).min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range == 0 {
        return capped;
    }
    capped + Duration::from_millis(rand::rng().random_range(0..=jitter_range))
}
