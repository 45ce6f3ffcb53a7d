//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use tessera_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("service-tickets/ST-1"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("service-tickets/ST-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    #[must_use]
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the half-open range `[prefix, successor)` covering every key
/// that starts with `prefix`.
///
/// The successor is computed by incrementing the last byte that is not
/// `0xFF` and truncating after it. A prefix made only of `0xFF` bytes (or
/// an empty prefix) has no finite successor; the range is then unbounded
/// above.
///
/// ```
/// use std::ops::Bound;
/// use tessera_storage::prefix_range;
///
/// let (start, end) = prefix_range(b"tickets/");
/// assert_eq!(start, Bound::Included(b"tickets/".to_vec()));
/// assert_eq!(end, Bound::Excluded(b"tickets0".to_vec()));
/// ```
#[must_use]
pub fn prefix_range(prefix: &[u8]) -> (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>) {
    use std::ops::Bound;

    let start = Bound::Included(prefix.to_vec());
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.pop() {
        if last < u8::MAX {
            successor.push(last + 1);
            return (start, Bound::Excluded(successor));
        }
    }
    (start, Bound::Unbounded)
}

#[cfg(test)]
mod tests {
    use std::ops::{Bound, RangeBounds};

    use super::*;

    #[test]
    fn successor_skips_trailing_ff() {
        let (_, end) = prefix_range(&[0x61, 0xFF, 0xFF]);
        assert_eq!(end, Bound::Excluded(vec![0x62]));
    }

    #[test]
    fn all_ff_prefix_is_unbounded() {
        let (_, end) = prefix_range(&[0xFF, 0xFF]);
        assert_eq!(end, Bound::Unbounded);
        let (_, end) = prefix_range(b"");
        assert_eq!(end, Bound::Unbounded);
    }

    #[test]
    fn range_contains_prefixed_keys_only() {
        let range = prefix_range(b"st/");
        assert!(range.contains(&b"st/".to_vec()));
        assert!(range.contains(&b"st/ST-1-abc".to_vec()));
        assert!(!range.contains(&b"st0".to_vec()));
        assert!(!range.contains(&b"sr/ST-1".to_vec()));
    }
}
