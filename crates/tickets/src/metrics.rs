//! Ticket lifecycle counters.
//!
//! [`RegistryMetrics`] counts lifecycle outcomes; the storage-level
//! counters fed by the retry helpers are available through
//! [`RegistryMetrics::storage`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tessera_storage::Metrics;

use crate::registry::Validation;

/// Point-in-time copy of the counters in [`RegistryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryMetricsSnapshot {
    /// Tickets issued by the factories.
    pub issued: u64,
    /// Successful validations.
    pub validated: u64,
    /// Validations of unknown, undecodable or mistyped ids.
    pub not_found: u64,
    /// Validations of expired tickets.
    pub expired: u64,
    /// Replays of consumed single-use tickets.
    pub already_consumed: u64,
    /// Validations refused by a throttle.
    pub throttled: u64,
    /// Records removed by explicit deletes, including cascades.
    pub deleted: u64,
    /// Records removed by the cleaner.
    pub swept: u64,
    /// Per-ticket cleaner failures.
    pub sweep_failures: u64,
}

/// Shared lifecycle counters.
#[derive(Clone, Default)]
pub struct RegistryMetrics {
    inner: Arc<RegistryMetricsInner>,
    storage: Metrics,
}

#[derive(Default)]
struct RegistryMetricsInner {
    issued: AtomicU64,
    validated: AtomicU64,
    not_found: AtomicU64,
    expired: AtomicU64,
    already_consumed: AtomicU64,
    throttled: AtomicU64,
    deleted: AtomicU64,
    swept: AtomicU64,
    sweep_failures: AtomicU64,
}

impl RegistryMetrics {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage operation counters.
    #[must_use]
    pub fn storage(&self) -> &Metrics {
        &self.storage
    }

    pub(crate) fn record_issued(&self) {
        self.inner.issued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation(&self, outcome: &Validation) {
        let counter = match outcome {
            Validation::Valid(_) => &self.inner.validated,
            Validation::NotFound => &self.inner.not_found,
            Validation::Expired => &self.inner.expired,
            Validation::AlreadyConsumed => &self.inner.already_consumed,
            Validation::Throttled => &self.inner.throttled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self, count: usize) {
        self.inner.deleted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(&self, count: usize) {
        self.inner.swept.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sweep_failure(&self) {
        self.inner.sweep_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of all lifecycle counters.
    #[must_use]
    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        let inner = &self.inner;
        RegistryMetricsSnapshot {
            issued: inner.issued.load(Ordering::Relaxed),
            validated: inner.validated.load(Ordering::Relaxed),
            not_found: inner.not_found.load(Ordering::Relaxed),
            expired: inner.expired.load(Ordering::Relaxed),
            already_consumed: inner.already_consumed.load(Ordering::Relaxed),
            throttled: inner.throttled.load(Ordering::Relaxed),
            deleted: inner.deleted.load(Ordering::Relaxed),
            swept: inner.swept.load(Ordering::Relaxed),
            sweep_failures: inner.sweep_failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for RegistryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryMetrics")
            .field("snapshot", &self.snapshot())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_outcomes_land_in_their_counter() {
        let metrics = RegistryMetrics::new();
        metrics.record_validation(&Validation::NotFound);
        metrics.record_validation(&Validation::AlreadyConsumed);
        metrics.record_validation(&Validation::AlreadyConsumed);
        metrics.record_deleted(4);

        let snapshot = metrics.clone().snapshot();
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.already_consumed, 2);
        assert_eq!(snapshot.deleted, 4);
        assert_eq!(snapshot.validated, 0);
    }
}
