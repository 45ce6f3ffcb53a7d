//! Exclusive locks shared across nodes.
//!
//! [`StorageLeaseLock`] keeps one record per lock under `__locks/<name>`
//! whose value is the holder's node id and whose TTL is the lease. Taking
//! the lock is an insert-if-absent, and releasing it is a compare-and-delete
//! on the holder's own id. An expired record counts as absent, so a lease
//! left behind by a crashed node is taken over once it lapses.
//!
//! Locks are not reentrant: a holder asking again is refused like anyone
//! else.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tessera_storage::{StorageBackend, StorageError};
use tokio::time::{Instant, sleep};

use crate::error::{TicketError, TicketResult};

/// Storage namespace of lock records.
pub const LOCK_NAMESPACE: &str = "__locks/";

/// Longest pause between acquisition attempts.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusive, named lock.
#[async_trait]
pub trait LockingStrategy: Send + Sync + fmt::Debug {
    /// Takes `name` if it is free. Returns `false` if someone holds it.
    async fn try_lock(&self, name: &str) -> TicketResult<bool>;

    /// Waits up to `wait` for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::LockTimeout`] when the wait elapses.
    async fn lock(&self, name: &str, wait: Duration) -> TicketResult<()> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_lock(name).await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TicketError::lock_timeout(name));
            }
            let pause = rand::rng().random_range(Duration::from_millis(1)..=MAX_POLL_INTERVAL);
            sleep(pause.min(deadline - now)).await;
        }
    }

    /// Releases `name` if this holder owns it.
    async fn unlock(&self, name: &str) -> TicketResult<()>;
}

/// A lock that is always free. Used when the backend is not shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLock;

#[async_trait]
impl LockingStrategy for NoOpLock {
    async fn try_lock(&self, _name: &str) -> TicketResult<bool> {
        Ok(true)
    }

    async fn unlock(&self, _name: &str) -> TicketResult<()> {
        Ok(())
    }
}

/// Lease lock stored in a [`StorageBackend`].
pub struct StorageLeaseLock<B> {
    backend: Arc<B>,
    owner: String,
    lease: Duration,
}

impl<B> StorageLeaseLock<B> {
    /// Creates a lock handle acting as `owner`.
    #[must_use]
    pub fn new(backend: Arc<B>, owner: impl Into<String>, lease: Duration) -> Self {
        Self { backend, owner: owner.into(), lease }
    }

    fn key(name: &str) -> Vec<u8> {
        format!("{LOCK_NAMESPACE}{name}").into_bytes()
    }
}

impl<B> fmt::Debug for StorageLeaseLock<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLeaseLock")
            .field("owner", &self.owner)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> LockingStrategy for StorageLeaseLock<B> {
    #[tracing::instrument(skip_all, fields(lock = name))]
    async fn try_lock(&self, name: &str) -> TicketResult<bool> {
        let result = self
            .backend
            .compare_and_set(&Self::key(name), None, self.owner.as_bytes().to_vec(), Some(self.lease))
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(StorageError::Conflict) => {
                tracing::debug!(lock = name, "lock held elsewhere");
                Ok(false)
            },
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip_all, fields(lock = name))]
    async fn unlock(&self, name: &str) -> TicketResult<()> {
        match self.backend.compare_and_delete(&Self::key(name), self.owner.as_bytes()).await {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict) => {
                tracing::debug!(lock = name, "lease already lapsed or taken over");
                Ok(())
            },
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tessera_storage::MemoryBackend;

    use super::*;

    fn pair(lease: Duration) -> (StorageLeaseLock<MemoryBackend>, StorageLeaseLock<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::without_sweeper());
        (
            StorageLeaseLock::new(Arc::clone(&backend), "node-a", lease),
            StorageLeaseLock::new(backend, "node-b", lease),
        )
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let (a, b) = pair(Duration::from_secs(30));
        assert!(a.try_lock("cleaner").await.unwrap());
        assert!(!b.try_lock("cleaner").await.unwrap());
        assert!(b.try_lock("other").await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_not_reentrant() {
        let (a, _) = pair(Duration::from_secs(30));
        assert!(a.try_lock("cleaner").await.unwrap());
        assert!(!a.try_lock("cleaner").await.unwrap());
    }

    #[tokio::test]
    async fn only_the_holder_releases() {
        let (a, b) = pair(Duration::from_secs(30));
        assert!(a.try_lock("cleaner").await.unwrap());

        b.unlock("cleaner").await.unwrap();
        assert!(!b.try_lock("cleaner").await.unwrap(), "foreign unlock must not free the lock");

        a.unlock("cleaner").await.unwrap();
        assert!(b.try_lock("cleaner").await.unwrap());
    }

    #[tokio::test]
    async fn lapsed_lease_is_taken_over() {
        let (a, b) = pair(Duration::from_millis(50));
        assert!(a.try_lock("cleaner").await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(b.try_lock("cleaner").await.unwrap());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let (a, b) = pair(Duration::from_secs(30));
        a.lock("ticket", Duration::from_millis(10)).await.unwrap();

        let err = b.lock("ticket", Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, TicketError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn waiter_gets_the_lock_once_released() {
        let (a, b) = pair(Duration::from_secs(30));
        let a = Arc::new(a);
        a.lock("ticket", Duration::from_millis(10)).await.unwrap();

        let holder = Arc::clone(&a);
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            holder.unlock("ticket").await.unwrap();
        });

        b.lock("ticket", Duration::from_secs(2)).await.unwrap();
        release.await.unwrap();
    }

    #[tokio::test]
    async fn noop_lock_is_always_free() {
        assert!(NoOpLock.try_lock("x").await.unwrap());
        assert!(NoOpLock.try_lock("x").await.unwrap());
        NoOpLock.unlock("x").await.unwrap();
    }
}
