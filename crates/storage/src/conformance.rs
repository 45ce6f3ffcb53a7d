//! Conformance test suite for [`StorageBackend`] implementations.
//!
//! Every backend runs the same checks so that the ticket registry can rely
//! on identical semantics whether it sits on memory or PostgreSQL.
//!
//! ```no_run
//! use tessera_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn cas_delete_exactly_one_winner() {
//!     let backend = std::sync::Arc::new(MemoryBackend::new());
//!     conformance::concurrent_compare_and_delete_exactly_one_winner(backend).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | Basic get/set/delete semantics |
//! | Range | Prefix scans, ordering, `clear_range` |
//! | TTL | `set_with_ttl` and CAS-carried expirations |
//! | CAS | `compare_and_set` / `compare_and_delete` preconditions |
//! | Transaction | Atomic commit, read-your-writes |
//! | Concurrent | Exactly-one-winner races |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::task::JoinSet;

use crate::{
    assert_conflict, backend::StorageBackend, error::StorageError, testutil::make_key,
    types::prefix_range,
};

/// Window used by TTL checks. Long enough for a network round trip, short
/// enough to keep the suite fast.
const SHORT_TTL: Duration = Duration::from_millis(200);

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a missing key returns `Ok(None)`.
pub async fn crud_get_missing_returns_none<B: StorageBackend>(backend: &B) {
    let value = backend.get(b"conf/missing").await.expect("get should not error");
    assert_eq!(value, None);
}

/// `set` overwrites and `get` observes the latest value.
pub async fn crud_set_overwrites<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/k".to_vec(), b"first".to_vec()).await.expect("set");
    backend.set(b"conf/k".to_vec(), b"second".to_vec()).await.expect("overwrite");
    assert_eq!(backend.get(b"conf/k").await.expect("get"), Some(Bytes::from("second")));
}

/// `delete` removes a key; deleting twice is not an error.
pub async fn crud_delete_is_idempotent<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/d".to_vec(), b"v".to_vec()).await.expect("set");
    backend.delete(b"conf/d").await.expect("first delete");
    backend.delete(b"conf/d").await.expect("second delete");
    assert_eq!(backend.get(b"conf/d").await.expect("get"), None);
}

/// Keys differing only in a trailing byte are distinct.
pub async fn crud_keys_are_byte_distinct<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/key".to_vec(), b"a".to_vec()).await.expect("set");
    backend.set(b"conf/key\x00".to_vec(), b"b".to_vec()).await.expect("set");
    assert_eq!(backend.get(b"conf/key").await.expect("get"), Some(Bytes::from("a")));
    assert_eq!(backend.get(b"conf/key\x00").await.expect("get"), Some(Bytes::from("b")));
}

// ============================================================================
// Range
// ============================================================================

/// A prefix scan returns only prefixed keys, in key order.
pub async fn range_prefix_scan_is_ordered_and_bounded<B: StorageBackend>(backend: &B) {
    for i in [3, 1, 2] {
        backend.set(make_key("conf-range", i), b"v".to_vec()).await.expect("set");
    }
    backend.set(b"conf-rangf/000001".to_vec(), b"outside".to_vec()).await.expect("set");

    let keys: Vec<Vec<u8>> = backend
        .get_range(prefix_range(b"conf-range/"))
        .await
        .expect("get_range")
        .into_iter()
        .map(|kv| kv.key.to_vec())
        .collect();
    assert_eq!(
        keys,
        vec![make_key("conf-range", 1), make_key("conf-range", 2), make_key("conf-range", 3)]
    );
}

/// `clear_range` removes the prefix and leaves neighbours alone.
pub async fn range_clear_prefix<B: StorageBackend>(backend: &B) {
    for i in 0..4 {
        backend.set(make_key("conf-clear", i), b"v".to_vec()).await.expect("set");
    }
    backend.set(b"conf-keep/1".to_vec(), b"v".to_vec()).await.expect("set");

    backend.clear_range(prefix_range(b"conf-clear/")).await.expect("clear_range");

    assert!(backend.get_range(prefix_range(b"conf-clear/")).await.expect("scan").is_empty());
    assert!(backend.get(b"conf-keep/1").await.expect("get").is_some());
}

// ============================================================================
// TTL
// ============================================================================

/// An entry written with a TTL disappears once it elapses.
pub async fn ttl_entry_expires<B: StorageBackend>(backend: &B) {
    backend.set_with_ttl(b"conf/ttl".to_vec(), b"v".to_vec(), SHORT_TTL).await.expect("set");
    assert!(backend.get(b"conf/ttl").await.expect("get").is_some());

    tokio::time::sleep(SHORT_TTL * 2).await;
    assert_eq!(backend.get(b"conf/ttl").await.expect("get"), None);
}

/// Expired entries are excluded from range scans.
pub async fn ttl_expired_entries_excluded_from_range<B: StorageBackend>(backend: &B) {
    backend.set_with_ttl(b"conf-exp/a".to_vec(), b"v".to_vec(), Duration::ZERO).await.expect("set");
    backend.set(b"conf-exp/b".to_vec(), b"v".to_vec()).await.expect("set");

    let entries = backend.get_range(prefix_range(b"conf-exp/")).await.expect("get_range");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, Bytes::from("conf-exp/b"));
}

/// A plain `set` over a TTL entry makes it permanent.
pub async fn ttl_plain_set_clears_ttl<B: StorageBackend>(backend: &B) {
    backend.set_with_ttl(b"conf/clear".to_vec(), b"v".to_vec(), SHORT_TTL).await.expect("set");
    backend.set(b"conf/clear".to_vec(), b"v2".to_vec()).await.expect("overwrite");

    tokio::time::sleep(SHORT_TTL * 2).await;
    assert_eq!(backend.get(b"conf/clear").await.expect("get"), Some(Bytes::from("v2")));
}

/// Purging reclaims expired entries and leaves live ones alone.
pub async fn ttl_purge_keeps_live_entries<B: StorageBackend>(backend: &B) {
    backend.set_with_ttl(b"conf/purge-dead".to_vec(), b"v".to_vec(), Duration::ZERO).await.expect("set");
    backend.set(b"conf/purge-live".to_vec(), b"v".to_vec()).await.expect("set");

    backend.purge_expired().await.expect("purge");
    assert_eq!(backend.get(b"conf/purge-dead").await.expect("get"), None);
    assert_eq!(backend.get(b"conf/purge-live").await.expect("get"), Some(Bytes::from("v")));
    backend.delete(b"conf/purge-live").await.expect("delete");
}

/// A CAS update keeps the TTL it is given rather than dropping it.
pub async fn ttl_carried_through_cas<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/cas-ttl".to_vec(), b"v1".to_vec()).await.expect("set");
    backend
        .compare_and_set(b"conf/cas-ttl", Some(b"v1"), b"v2".to_vec(), Some(SHORT_TTL))
        .await
        .expect("cas");

    tokio::time::sleep(SHORT_TTL * 2).await;
    assert_eq!(backend.get(b"conf/cas-ttl").await.expect("get"), None);
}

// ============================================================================
// CAS
// ============================================================================

/// `expected: None` inserts only when the key is absent.
pub async fn cas_insert_if_absent<B: StorageBackend>(backend: &B) {
    backend.compare_and_set(b"conf/ins", None, b"a".to_vec(), None).await.expect("insert");
    assert_conflict!(backend.compare_and_set(b"conf/ins", None, b"b".to_vec(), None).await);
    assert_eq!(backend.get(b"conf/ins").await.expect("get"), Some(Bytes::from("a")));
}

/// An expired entry counts as absent for insert-if-absent.
pub async fn cas_insert_over_expired_entry<B: StorageBackend>(backend: &B) {
    backend.set_with_ttl(b"conf/lease".to_vec(), b"old".to_vec(), Duration::ZERO).await.expect("set");
    backend.compare_and_set(b"conf/lease", None, b"new".to_vec(), None).await.expect("insert");
    assert_eq!(backend.get(b"conf/lease").await.expect("get"), Some(Bytes::from("new")));
}

/// Update-if-unchanged rejects a stale expectation.
pub async fn cas_update_requires_current_value<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/upd".to_vec(), b"v1".to_vec()).await.expect("set");
    assert_conflict!(
        backend.compare_and_set(b"conf/upd", Some(b"stale"), b"v2".to_vec(), None).await
    );
    backend.compare_and_set(b"conf/upd", Some(b"v1"), b"v2".to_vec(), None).await.expect("cas");
    assert_eq!(backend.get(b"conf/upd").await.expect("get"), Some(Bytes::from("v2")));
}

/// `compare_and_delete` removes only a matching value and fails on absence.
pub async fn cas_delete_requires_match<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/cad".to_vec(), b"v1".to_vec()).await.expect("set");
    assert_conflict!(backend.compare_and_delete(b"conf/cad", b"other").await);
    backend.compare_and_delete(b"conf/cad", b"v1").await.expect("delete");
    assert_conflict!(backend.compare_and_delete(b"conf/cad", b"v1").await);
    assert_conflict!(backend.compare_and_delete(b"conf/never", b"v1").await);
}

// ============================================================================
// Transaction
// ============================================================================

/// Reads inside a transaction see its own pending writes.
pub async fn tx_read_your_writes<B: StorageBackend>(backend: &B) {
    let mut txn = backend.transaction().await.expect("begin");
    txn.set(b"conf/tx-ryw".to_vec(), b"pending".to_vec());
    assert_eq!(txn.get(b"conf/tx-ryw").await.expect("get"), Some(Bytes::from("pending")));
    txn.delete(b"conf/tx-ryw".to_vec());
    assert_eq!(txn.get(b"conf/tx-ryw").await.expect("get"), None);
}

/// All buffered writes and deletes land on commit.
pub async fn tx_commit_applies_all<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/tx-old".to_vec(), b"x".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("begin");
    txn.set(b"conf/tx-a".to_vec(), b"1".to_vec());
    txn.set(b"conf/tx-b".to_vec(), b"2".to_vec());
    txn.delete(b"conf/tx-old".to_vec());
    txn.commit().await.expect("commit");

    assert_eq!(backend.get(b"conf/tx-a").await.expect("get"), Some(Bytes::from("1")));
    assert_eq!(backend.get(b"conf/tx-b").await.expect("get"), Some(Bytes::from("2")));
    assert_eq!(backend.get(b"conf/tx-old").await.expect("get"), None);
}

/// Dropping an uncommitted transaction changes nothing.
pub async fn tx_drop_discards<B: StorageBackend>(backend: &B) {
    {
        let mut txn = backend.transaction().await.expect("begin");
        txn.set(b"conf/tx-drop".to_vec(), b"v".to_vec());
    }
    assert_eq!(backend.get(b"conf/tx-drop").await.expect("get"), None);
}

/// A failing buffered CAS aborts the whole commit.
pub async fn tx_cas_conflict_aborts_commit<B: StorageBackend>(backend: &B) {
    backend.set(b"conf/tx-cas".to_vec(), b"current".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("begin");
    txn.set(b"conf/tx-side".to_vec(), b"v".to_vec());
    txn.compare_and_set(b"conf/tx-cas".to_vec(), Some(b"stale".to_vec()), b"new".to_vec())
        .expect("buffer cas");
    assert_conflict!(txn.commit().await);

    assert_eq!(backend.get(b"conf/tx-side").await.expect("get"), None);
    assert_eq!(backend.get(b"conf/tx-cas").await.expect("get"), Some(Bytes::from("current")));
}

// ============================================================================
// Concurrent
// ============================================================================

/// Of many tasks racing to delete the same value, exactly one succeeds.
pub async fn concurrent_compare_and_delete_exactly_one_winner<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    backend.set(b"conf/race".to_vec(), b"single-use".to_vec()).await.expect("set");

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move { backend.compare_and_delete(b"conf/race", b"single-use").await });
    }

    let mut winners = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("task panicked") {
            Ok(()) => winners += 1,
            Err(StorageError::Conflict) => {},
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1, "exactly one compare_and_delete must win");
}

/// Of many tasks racing an insert-if-absent, exactly one succeeds.
pub async fn concurrent_cas_insert_exactly_one_winner<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    let mut tasks = JoinSet::new();
    for i in 0..32u8 {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            backend.compare_and_set(b"conf/lock", None, vec![i], None).await
        });
    }

    let mut winners = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.expect("task panicked").is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one insert-if-absent must win");
}

/// `health_check` succeeds on a working backend.
pub async fn health_check_succeeds<B: StorageBackend>(backend: &B) {
    backend.health_check().await.expect("healthy backend");
}

/// Runs every check against a single backend. Checks use disjoint keys, so
/// they share the instance.
pub async fn run_all<B: StorageBackend + 'static>(backend: Arc<B>) {
    let b = backend.as_ref();
    crud_get_missing_returns_none(b).await;
    crud_set_overwrites(b).await;
    crud_delete_is_idempotent(b).await;
    crud_keys_are_byte_distinct(b).await;
    range_prefix_scan_is_ordered_and_bounded(b).await;
    range_clear_prefix(b).await;
    ttl_entry_expires(b).await;
    ttl_expired_entries_excluded_from_range(b).await;
    ttl_plain_set_clears_ttl(b).await;
    ttl_carried_through_cas(b).await;
    ttl_purge_keeps_live_entries(b).await;
    cas_insert_if_absent(b).await;
    cas_insert_over_expired_entry(b).await;
    cas_update_requires_current_value(b).await;
    cas_delete_requires_match(b).await;
    tx_read_your_writes(b).await;
    tx_commit_applies_all(b).await;
    tx_drop_discards(b).await;
    tx_cas_conflict_aborts_commit(b).await;
    health_check_succeeds(b).await;
    concurrent_compare_and_delete_exactly_one_winner(Arc::clone(&backend)).await;
    concurrent_cas_insert_exactly_one_winner(backend).await;
}
