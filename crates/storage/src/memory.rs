//! In-memory storage backend.
//!
//! [`MemoryBackend`] keeps entries in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`]. It is the default backend for single-node
//! deployments and for tests.
//!
//! # TTL Handling
//!
//! Each entry carries an optional deadline. Expired entries are hidden
//! from every read immediately. Physical removal happens in a background
//! sweep (once per second) unless the backend was built with
//! [`MemoryBackend::without_sweeper`], in which case entries linger until
//! overwritten or deleted and [`has_native_ttl`](StorageBackend::has_native_ttl)
//! reports `false`.
//!
//! # Performance Characteristics
//!
//! | Operation | Complexity |
//! |-----------|------------|
//! | get / set / delete / CAS | O(log n) |
//! | get_range | O(log n + k) |
//! | sweep | O(n) every second |

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{select, sync::watch, time::sleep};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::Transaction,
    types::KeyValue,
};

/// Sweep cadence for the background TTL task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self { value: Bytes::from(value), expires_at: ttl.map(|ttl| Instant::now() + ttl) }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

type Store = BTreeMap<Vec<u8>, Entry>;

fn live_value(store: &Store, key: &[u8], now: Instant) -> Option<Bytes> {
    store.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone())
}

/// Holds the sweep task's shutdown sender. Dropping the last clone of the
/// backend drops this guard, which stops the sweep.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend.
///
/// Cheaply cloneable; all clones share the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<Store>>,
    shutdown_guard: Option<Arc<ShutdownGuard>>,
}

impl MemoryBackend {
    /// Creates a backend with a background TTL sweep.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// ```
    /// use tessera_storage::{MemoryBackend, StorageBackend};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let backend = MemoryBackend::new();
    ///     assert!(backend.has_native_ttl());
    /// }
    /// ```
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_guard: Some(Arc::new(ShutdownGuard { shutdown_tx })),
        };

        let data = Arc::clone(&backend.data);
        tokio::spawn(sweep_expired(data, shutdown_rx));

        backend
    }

    /// Creates a backend that never physically evicts expired entries.
    ///
    /// Expired entries are still invisible to reads. Useful when an
    /// external sweeper owns reclamation, and in tests that need a
    /// deterministic store.
    #[must_use]
    pub fn without_sweeper() -> Self {
        Self { data: Arc::new(RwLock::new(BTreeMap::new())), shutdown_guard: None }
    }

    /// Stops the background sweep early. Subsequent clones keep working;
    /// expired entries are simply no longer removed.
    pub fn shutdown(&self) {
        if let Some(guard) = &self.shutdown_guard {
            let _ = guard.shutdown_tx.send(());
        }
    }

    /// Number of physically stored entries, including expired ones that
    /// have not been swept yet.
    #[must_use]
    pub fn stored_entries(&self) -> usize {
        self.data.read().len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.data.read().len())
            .field("sweeper", &self.shutdown_guard.is_some())
            .finish()
    }
}

async fn sweep_expired(data: Arc<RwLock<Store>>, mut shutdown_rx: watch::Receiver<()>) {
    loop {
        select! {
            _ = sleep(SWEEP_INTERVAL) => {}
            _ = shutdown_rx.changed() => return,
        }

        let removed = purge(&data, Instant::now());
        if removed > 0 {
            tracing::debug!(removed, "swept expired entries");
        }
    }
}

fn purge(data: &RwLock<Store>, now: Instant) -> usize {
    let expired: Vec<Vec<u8>> = data
        .read()
        .iter()
        .filter(|(_, entry)| !entry.is_live(now))
        .map(|(key, _)| key.clone())
        .collect();

    if expired.is_empty() {
        return 0;
    }

    // Re-check under the write lock: an entry may have been rewritten
    // since the scan.
    let mut store = data.write();
    let mut removed = 0;
    for key in expired {
        if store.get(&key).is_some_and(|entry| !entry.is_live(now)) {
            store.remove(&key);
            removed += 1;
        }
    }
    removed
}

fn borrowed_bounds<R: RangeBounds<Vec<u8>>>(range: &R) -> (Bound<&[u8]>, Bound<&[u8]>) {
    fn convert(bound: Bound<&Vec<u8>>) -> Bound<&[u8]> {
        match bound {
            Bound::Included(b) => Bound::Included(b.as_slice()),
            Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
            Bound::Unbounded => Bound::Unbounded,
        }
    }
    (convert(range.start_bound()), convert(range.end_bound()))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(live_value(&self.data.read(), key, Instant::now()))
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.data.write().insert(key, Entry::new(value, None));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.data.write().insert(key, Entry::new(value, Some(ttl)));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), insert = expected.is_none()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let mut store = self.data.write();
        let current = live_value(&store, key, Instant::now());

        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        store.insert(key.to_vec(), Entry::new(new_value, ttl));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        let mut store = self.data.write();
        match live_value(&store, key, Instant::now()) {
            Some(current) if current[..] == *expected => {
                store.remove(key);
                Ok(())
            },
            _ => Err(StorageError::Conflict),
        }
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let now = Instant::now();
        let store = self.data.read();
        Ok(store
            .range::<[u8], _>(borrowed_bounds(&range))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(k, entry)| KeyValue::new(Bytes::copy_from_slice(k), entry.value.clone()))
            .collect())
    }

    #[tracing::instrument(skip_all)]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let mut store = self.data.write();
        let keys: Vec<Vec<u8>> =
            store.range::<[u8], _>(borrowed_bounds(&range)).map(|(k, _)| k.clone()).collect();
        for key in keys {
            store.remove(&key);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Taking the read lock proves the store is not wedged.
        let _store = self.data.read();
        Ok(())
    }

    fn has_native_ttl(&self) -> bool {
        self.shutdown_guard.is_some()
    }

    #[tracing::instrument(skip_all)]
    async fn purge_expired(&self) -> StorageResult<usize> {
        Ok(purge(&self.data, Instant::now()))
    }
}

#[derive(Debug)]
struct CasOperation {
    key: Vec<u8>,
    expected: Option<Vec<u8>>,
    new_value: Vec<u8>,
}

/// Buffers writes until commit, then applies them under one write lock.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_cas: Vec<CasOperation>,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend) -> Self {
        Self { backend, pending_writes: BTreeMap::new(), pending_cas: Vec::new() }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if let Some(pending) = self.pending_writes.get(key) {
            return Ok(pending.as_ref().map(|v| Bytes::copy_from_slice(v)));
        }
        self.backend.get(key).await
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, None);
    }

    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.pending_cas.push(CasOperation { key, expected, new_value });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let now = Instant::now();
        let mut store = self.backend.data.write();

        for cas in &self.pending_cas {
            let current = live_value(&store, &cas.key, now);
            let holds = match (&cas.expected, &current) {
                (None, None) => true,
                (Some(expected), Some(current)) => expected.as_slice() == &current[..],
                _ => false,
            };
            if !holds {
                return Err(StorageError::Conflict);
            }
        }

        for cas in self.pending_cas {
            store.insert(cas.key, Entry::new(cas.new_value, None));
        }
        for (key, value) in self.pending_writes {
            match value {
                Some(v) => {
                    store.insert(key, Entry::new(v, None));
                },
                None => {
                    store.remove(&key);
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_are_hidden_before_sweep() {
        let backend = MemoryBackend::without_sweeper();
        backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::ZERO).await.unwrap();

        assert_eq!(backend.get(b"k").await.unwrap(), None);
        assert!(backend.get_range(..).await.unwrap().is_empty());
        // Still physically present: nothing sweeps this backend.
        assert_eq!(backend.stored_entries(), 1);
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let backend = MemoryBackend::new();
        backend
            .set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(backend.stored_entries(), 0);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_entries() {
        let backend = MemoryBackend::without_sweeper();
        backend.set_with_ttl(b"dead".to_vec(), b"v".to_vec(), Duration::ZERO).await.unwrap();
        backend.set(b"live".to_vec(), b"v".to_vec()).await.unwrap();

        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.stored_entries(), 1);
        assert_eq!(backend.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn native_ttl_follows_sweeper() {
        assert!(MemoryBackend::new().has_native_ttl());
        assert!(!MemoryBackend::without_sweeper().has_native_ttl());
    }

    #[tokio::test]
    async fn cas_insert_over_expired_entry() {
        let backend = MemoryBackend::without_sweeper();
        backend.set_with_ttl(b"lock".to_vec(), b"old".to_vec(), Duration::ZERO).await.unwrap();

        backend.compare_and_set(b"lock", None, b"new".to_vec(), None).await.unwrap();
        assert_eq!(backend.get(b"lock").await.unwrap(), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn cas_applies_requested_ttl() {
        let backend = MemoryBackend::without_sweeper();
        backend.set(b"k".to_vec(), b"a".to_vec()).await.unwrap();

        backend.compare_and_set(b"k", Some(b"a"), b"b".to_vec(), Some(Duration::ZERO)).await.unwrap();
        assert_eq!(backend.get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_delete_rejects_expired_entry() {
        let backend = MemoryBackend::without_sweeper();
        backend.set_with_ttl(b"k".to_vec(), b"v".to_vec(), Duration::ZERO).await.unwrap();

        let result = backend.compare_and_delete(b"k", b"v").await;
        assert!(matches!(result, Err(StorageError::Conflict)));
    }

    #[tokio::test]
    async fn transaction_cas_failure_applies_nothing() {
        let backend = MemoryBackend::without_sweeper();
        backend.set(b"parent".to_vec(), b"v1".to_vec()).await.unwrap();
        backend.set(b"child".to_vec(), b"c".to_vec()).await.unwrap();

        let mut txn = backend.transaction().await.unwrap();
        txn.delete(b"child".to_vec());
        txn.compare_and_set(b"parent".to_vec(), Some(b"stale".to_vec()), b"v2".to_vec()).unwrap();
        assert!(matches!(txn.commit().await, Err(StorageError::Conflict)));

        assert_eq!(backend.get(b"child").await.unwrap(), Some(Bytes::from("c")));
        assert_eq!(backend.get(b"parent").await.unwrap(), Some(Bytes::from("v1")));
    }

    #[tokio::test]
    async fn clear_range_removes_expired_entries_too() {
        let backend = MemoryBackend::without_sweeper();
        backend.set_with_ttl(b"p/1".to_vec(), b"x".to_vec(), Duration::ZERO).await.unwrap();
        backend.set(b"p/2".to_vec(), b"y".to_vec()).await.unwrap();

        backend.clear_range(crate::prefix_range(b"p/")).await.unwrap();
        assert_eq!(backend.stored_entries(), 0);
    }

    mod proptest_ranges {
        use proptest::prelude::*;

        use super::*;

        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime")
        }

        proptest! {
            #[test]
            fn prefix_scan_returns_exactly_prefixed_keys(
                keys in proptest::collection::btree_set(proptest::collection::vec(0u8..4, 0..4), 0..24),
                prefix in proptest::collection::vec(0u8..4, 0..3),
            ) {
                let rt = runtime();
                rt.block_on(async {
                    let backend = MemoryBackend::without_sweeper();
                    for key in &keys {
                        backend.set(key.clone(), b"v".to_vec()).await.unwrap();
                    }

                    let found: Vec<Vec<u8>> = backend
                        .get_range(crate::prefix_range(&prefix))
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|kv| kv.key.to_vec())
                        .collect();
                    let expected: Vec<Vec<u8>> =
                        keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
                    prop_assert_eq!(found, expected);
                    Ok(())
                })?;
            }
        }
    }
}
