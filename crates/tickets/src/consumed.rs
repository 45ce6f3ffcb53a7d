//! Memory of recently consumed single-use tickets.
//!
//! Once a single-use ticket has been consumed its record is gone from
//! storage, so a second presentation would ordinarily look like any other
//! unknown id. Remembering consumed ids for a bounded window lets the
//! registry report [`Validation::AlreadyConsumed`](crate::Validation) and
//! log the replay distinctly. Callers still treat it like "not found".
//!
//! The memory is per node: a replay presented to another node is reported
//! as not found.

use std::time::{Duration, Instant};

use moka::{future::Cache, policy::EvictionPolicy};

/// Per-entry expiry storing the absolute forget-at instant.
struct ForgetAt;

impl moka::Expiry<String, Instant> for ForgetAt {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Instant,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.saturating_duration_since(created_at))
    }
}

/// Bounded, self-expiring set of consumed ticket ids.
#[derive(Clone)]
pub(crate) struct ConsumedTickets {
    seen: Cache<String, Instant>,
    retention: Duration,
}

impl ConsumedTickets {
    /// Remembers at most `capacity` ids, each for `retention`.
    pub(crate) fn new(capacity: u64, retention: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(ForgetAt)
            .build();
        Self { seen, retention }
    }

    pub(crate) async fn record(&self, id: &str) {
        self.seen.insert(id.to_owned(), Instant::now() + self.retention).await;
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) async fn run_pending_tasks(&self) {
        self.seen.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for ConsumedTickets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumedTickets")
            .field("entries", &self.seen.entry_count())
            .field("retention", &self.retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remembers_consumed_ids() {
        let consumed = ConsumedTickets::new(100, Duration::from_secs(60));
        assert!(!consumed.contains("ST-1-abc"));
        consumed.record("ST-1-abc").await;
        assert!(consumed.contains("ST-1-abc"));
        assert!(!consumed.contains("ST-2-abc"));
    }

    #[tokio::test]
    async fn forgets_after_retention() {
        let consumed = ConsumedTickets::new(100, Duration::from_millis(50));
        consumed.record("ST-1-abc").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        consumed.run_pending_tasks().await;

        assert!(!consumed.contains("ST-1-abc"));
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let consumed = ConsumedTickets::new(2, Duration::from_secs(300));
        for id in ["ST-1", "ST-2", "ST-3"] {
            consumed.record(id).await;
        }
        consumed.run_pending_tasks().await;

        assert!(consumed.seen.entry_count() <= 2);
    }
}
