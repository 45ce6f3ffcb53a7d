//! Transaction trait for atomic multi-key writes.
//!
//! A transaction buffers writes and deletes until [`Transaction::commit`],
//! where they are applied all-or-nothing. Reads inside the transaction see
//! its own pending writes. Buffered compare-and-set conditions are verified
//! at commit time; if any fails, nothing is applied.
//!
//! # Example
//!
//! ```
//! use tessera_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//! backend.set(b"tgt/TGT-1".to_vec(), b"session".to_vec()).await.unwrap();
//! backend.set(b"st/ST-1".to_vec(), b"service".to_vec()).await.unwrap();
//!
//! // Revoke a session and its service ticket together.
//! let mut txn = backend.transaction().await.unwrap();
//! txn.delete(b"tgt/TGT-1".to_vec());
//! txn.delete(b"st/ST-1".to_vec());
//! txn.commit().await.unwrap();
//!
//! assert!(backend.get(b"st/ST-1").await.unwrap().is_none());
//! # });
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Buffered atomic operations against a [`StorageBackend`](crate::StorageBackend).
///
/// Dropping a transaction without committing discards it.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Reads a key, observing this transaction's pending writes first.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers a write.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers a delete.
    fn delete(&mut self, key: Vec<u8>);

    /// Buffers a conditional write verified at commit.
    ///
    /// `expected: None` requires the key to be absent at commit time.
    ///
    /// # Errors
    ///
    /// Implementations may reject the buffered operation eagerly; the
    /// in-memory and PostgreSQL transactions only fail at commit.
    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Applies every buffered operation atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`](crate::StorageError::Conflict) if a
    /// buffered compare-and-set condition no longer holds, or a backend
    /// error if the commit could not be applied.
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}
