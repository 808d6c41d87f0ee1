//! In-memory index store for tests and ephemeral nodes.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::{DatabaseError, IndexStore, Query, RawRead, WriteBatch};

type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Index store backed by ordered maps behind a single `RwLock`.
///
/// A write batch is applied under the write lock, so readers see either the
/// state before it or after it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, TableMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all tables.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RawRead for MemoryStore {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn scan_raw(
        &self,
        table: &'static str,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let tables = self.tables.read();
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };

        Ok(entries
            .range(query.start_bytes().to_vec()..)
            .take_while(|(key, _)| key.starts_with(query.prefix_bytes()))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_raw(&self, table: &'static str) -> Result<u64, DatabaseError> {
        Ok(self.tables.read().get(table).map_or(0, |t| t.len() as u64))
    }
}

impl IndexStore for MemoryStore {
    fn write(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        let mut tables = self.tables.write();
        for (table, key, value) in batch.into_ops() {
            let entries = tables.entry(table).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
