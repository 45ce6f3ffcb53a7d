//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so nothing here reaches production
//! builds.
//!
//! ```toml
//! [dev-dependencies]
//! tessera-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::time::Duration;

use crate::{StorageBackend, memory::MemoryBackend};

/// Deterministic key of the form `"{prefix}/{idx:06}"`.
///
/// Zero padding keeps lexicographic order equal to numeric order, which
/// range tests rely on.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}/{idx:06}").into_bytes()
}

/// Value tagged with the writing task and a sequence number, e.g.
/// `"task3-val042"`.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// A sweeper-less [`MemoryBackend`] holding `count` entries under `prefix`,
/// each expiring after `ttl`.
///
/// # Panics
///
/// Panics if a write fails.
pub async fn backend_with_entries(prefix: &str, count: usize, ttl: Duration) -> MemoryBackend {
    let backend = MemoryBackend::without_sweeper();
    for i in 0..count {
        backend
            .set_with_ttl(make_key(prefix, i), make_tagged_value(0, i), ttl)
            .await
            .expect("populate set_with_ttl failed");
    }
    backend
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tessera_storage::{assert_conflict, StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::Conflict);
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            result,
        );
    }};
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`](crate::StorageResult) is `Ok`, returning
/// the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("expected Ok, got storage error: {e:?}"),
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::prefix_range;

    #[test]
    fn keys_sort_numerically() {
        assert!(make_key("t", 9) < make_key("t", 10));
        assert_eq!(make_key("t", 42), b"t/000042".to_vec());
    }

    #[test]
    fn assert_conflict_evaluates_once() {
        let mut calls = 0;
        let mut attempt = || {
            calls += 1;
            Err::<(), _>(crate::error::StorageError::Conflict)
        };
        assert_conflict!(attempt());
        assert_conflict!(attempt(), "second attempt");
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn populated_backend_holds_every_entry() {
        let backend = backend_with_entries("st", 5, Duration::from_secs(60)).await;
        let entries = backend.get_range(prefix_range(b"st/")).await.unwrap();
        assert_eq!(entries.len(), 5);
    }
}
