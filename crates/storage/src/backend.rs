//! Storage backend trait definition.
//!
//! [`StorageBackend`] is a small, byte-oriented key-value contract. Ticket
//! semantics (encoding, expiration policies, cascades) live in the registry
//! built on top of it; backends only need to honour the atomicity rules
//! below.
//!
//! # Atomicity Contract
//!
//! | Operation | Guarantee |
//! |-----------|-----------|
//! | [`compare_and_set`](StorageBackend::compare_and_set) | Linearizable per key |
//! | [`compare_and_delete`](StorageBackend::compare_and_delete) | Linearizable per key; exactly one of N racing callers succeeds |
//! | [`transaction`](StorageBackend::transaction) | All buffered writes apply together or not at all |
//! | everything else | Last writer wins |
//!
//! # Implementing a Backend
//!
//! 1. Implement [`StorageBackend`]
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError), classifying network
//!    failures as [`Connection`](crate::StorageError::Connection) so that callers retry them
//! 4. Run the [`conformance`](crate::conformance) suite against it

use std::{ops::RangeBounds, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, transaction::Transaction, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends are `Send + Sync` and are shared across request tasks.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value |
/// | [`set`](StorageBackend::set) / [`set_with_ttl`](StorageBackend::set_with_ttl) | Store a value |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Conditional store |
/// | [`compare_and_delete`](StorageBackend::compare_and_delete) | Conditional removal |
/// | [`delete`](StorageBackend::delete) | Unconditional removal |
/// | [`get_range`](StorageBackend::get_range) / [`clear_range`](StorageBackend::clear_range) | Ordered scans |
/// | [`transaction`](StorageBackend::transaction) | Atomic multi-key writes |
/// | [`health_check`](StorageBackend::health_check) | Availability check |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use tessera_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// assert_eq!(backend.get(b"key").await.unwrap(), Some(Bytes::from("value")));
///
/// // Exactly one consumer can take a value away.
/// backend.compare_and_delete(b"key", b"value").await.unwrap();
/// assert!(backend.compare_and_delete(b"key", b"value").await.is_err());
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Expired entries are reported as absent even if the backend has not
    /// physically removed them yet.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any previous value and clearing
    /// any TTL on the key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    ///
    /// A zero TTL stores an entry that is immediately invisible.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically replaces a key's value if it matches `expected`.
    ///
    /// - `expected: None` is insert-if-absent; an expired entry counts as absent.
    /// - `expected: Some(v)` is update-if-unchanged, compared byte for byte.
    ///
    /// On success the entry takes `ttl` (or no TTL when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if the
    /// precondition does not hold.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Atomically removes a key if its current value equals `expected`.
    ///
    /// This is the primitive behind single-use consumption: when several
    /// callers race to remove the same value, exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if the
    /// key is absent, expired, or holds a different value.
    #[must_use = "compare-and-delete may fail with a conflict and errors must be handled"]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()>;

    /// Removes a key. Removing an absent key is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Returns live entries within `range`, in key order.
    ///
    /// Use [`prefix_range`](crate::prefix_range) to scan a key prefix.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Removes every key within `range`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Begins a new transaction.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Verifies that the backend can serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;

    /// Whether the backend physically evicts entries once their TTL elapses.
    ///
    /// Backends that only hide expired entries from reads return `false`;
    /// their consumers must run a sweeper to reclaim space.
    fn has_native_ttl(&self) -> bool {
        false
    }

    /// Physically removes entries whose TTL has elapsed and returns how many
    /// were removed.
    ///
    /// Backends with native TTL eviction may return `Ok(0)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn purge_expired(&self) -> StorageResult<usize> {
        Ok(0)
    }
}
