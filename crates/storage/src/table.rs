//! Tables and queries.

use crate::{Encode, Key, Value};

/// A typed namespace in the index store.
///
/// One logical record type maps to exactly one table. Entries are ordered by
/// the encoded key.
pub trait Table: Send + Sync + 'static {
    /// Stable namespace name, persisted on disk.
    const NAME: &'static str;
    /// Key type.
    type Key: Key;
    /// Value type.
    type Value: Value;
}

/// Selects a key range within a table.
///
/// A query matches keys that start with `prefix` and are not smaller than
/// `start`. Results are always produced in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    prefix: Vec<u8>,
    start: Vec<u8>,
}

impl Query {
    /// Every entry in the table.
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries whose key starts with the encoding of `prefix`.
    ///
    /// Because tuple keys concatenate their parts, a leading tuple element
    /// is a valid prefix: `Query::prefix(bin)` over `(u8, u64, Address)`
    /// keys selects a single bin.
    pub fn prefix<P: Encode>(prefix: P) -> Self {
        let prefix: Vec<u8> = prefix.encode().into();
        Self {
            start: prefix.clone(),
            prefix,
        }
    }

    /// Starts iteration at the first key not smaller than `key`.
    pub fn start_at<K: Encode>(self, key: K) -> Self {
        self.start_at_raw(key.encode().into())
    }

    /// Starts iteration at the first key not smaller than raw `start`.
    pub fn start_at_raw(mut self, start: Vec<u8>) -> Self {
        if start > self.start {
            self.start = start;
        }
        self
    }

    pub fn prefix_bytes(&self) -> &[u8] {
        &self.prefix
    }

    pub fn start_bytes(&self) -> &[u8] {
        &self.start
    }

    /// Whether `key` falls inside this query.
    pub fn matches(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix) && key >= self.start.as_slice()
    }
}

/// Smallest key strictly greater than `key`.
pub(crate) fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_query_bounds() {
        let query = Query::prefix(3u8);
        assert!(query.matches(&(3u8, 7u64).encode()));
        assert!(!query.matches(&(4u8, 0u64).encode()));
        assert!(!query.matches(&(2u8, u64::MAX).encode()));
    }

    #[test]
    fn test_start_never_moves_before_prefix() {
        let query = Query::prefix(3u8).start_at(1u8);
        assert_eq!(query.start_bytes(), &[3]);

        let query = Query::prefix(3u8).start_at((3u8, 10u64));
        assert!(!query.matches(&(3u8, 9u64).encode()));
        assert!(query.matches(&(3u8, 10u64).encode()));
    }

    #[test]
    fn test_successor_is_next_key() {
        let key = 5u64.encode();
        let next = successor(&key);
        assert!(next.as_slice() > key.as_slice());
        assert!(next.as_slice() < 6u64.encode().as_slice());
    }
}
