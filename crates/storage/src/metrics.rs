//! Storage operation counters.
//!
//! [`Metrics`] is a cheap-to-clone handle over relaxed atomic counters. It
//! is fed by the retry helpers and by storage consumers that want to
//! observe operation volume, failure rates and contention.
//!
//! All counters use `Ordering::Relaxed`: each one is independent and
//! monotonic, and a [`MetricsSnapshot`] is a telemetry view, not a
//! transactional one.
//!
//! ```
//! use std::time::Duration;
//! use tessera_storage::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_operation(Duration::from_micros(120));
//! metrics.record_conflict();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.operations, 1);
//! assert_eq!(snapshot.conflicts, 1);
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Point-in-time copy of the counters in [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Completed backend operations (successful or not).
    pub operations: u64,
    /// Cumulative operation latency in microseconds.
    pub latency_us: u64,
    /// Operations that returned an error.
    pub errors: u64,
    /// Compare-and-set preconditions that failed.
    pub conflicts: u64,
    /// Operations that hit their deadline.
    pub timeouts: u64,
    /// Retry attempts after a transient failure.
    pub retries: u64,
    /// Operations that failed after exhausting their retries.
    pub retries_exhausted: u64,
}

impl MetricsSnapshot {
    /// Mean operation latency in microseconds, or `0.0` with no samples.
    #[must_use]
    pub fn avg_latency_us(&self) -> f64 {
        if self.operations == 0 { 0.0 } else { self.latency_us as f64 / self.operations as f64 }
    }

    /// Fraction of operations that failed.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.operations == 0 { 0.0 } else { self.errors as f64 / self.operations as f64 }
    }
}

/// Shared storage counters.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    operations: AtomicU64,
    latency_us: AtomicU64,
    errors: AtomicU64,
    conflicts: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
}

impl Metrics {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed operation and its latency.
    pub fn record_operation(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.inner.operations.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Records a failed operation.
    pub fn record_error(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lost compare-and-set race.
    pub fn record_conflict(&self) {
        self.inner.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that exceeded its deadline.
    pub fn record_timeout(&self) {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry after a transient failure.
    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an operation that failed after all retries.
    pub fn record_retry_exhausted(&self) {
        self.inner.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            operations: inner.operations.load(Ordering::Relaxed),
            latency_us: inner.latency_us.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            conflicts: inner.conflicts.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            retries_exhausted: inner.retries_exhausted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").field("snapshot", &self.snapshot()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_retry();
        clone.record_retry();
        metrics.record_retry_exhausted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.retries_exhausted, 1);
    }

    #[test]
    fn rates_handle_empty_snapshot() {
        let snapshot = MetricsSnapshot::default();
        assert_eq!(snapshot.avg_latency_us(), 0.0);
        assert_eq!(snapshot.error_rate(), 0.0);
    }

    #[test]
    fn average_latency() {
        let metrics = Metrics::new();
        metrics.record_operation(Duration::from_micros(100));
        metrics.record_operation(Duration::from_micros(300));
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_latency_us(), 200.0);
        assert_eq!(snapshot.error_rate(), 0.5);
    }
}
