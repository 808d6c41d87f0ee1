//! Buffered index transactions.

use std::sync::Arc;

use tracing::trace;

use crate::{DatabaseError, IndexStore, Query, RawRead, Table, WriteBatch};

/// Buffers writes against an [`IndexStore`] and applies them atomically on
/// [`commit`](Self::commit).
///
/// Point reads (`get`, `has`) observe the transaction's own buffered writes.
/// Scans and counts observe the last committed state. Dropping an
/// uncommitted transaction discards the buffer.
///
/// The index transaction does not serialize writers by itself; callers that
/// need a single writer hold a lock for the transaction's lifetime.
#[derive(Debug)]
pub struct IndexTransaction {
    store: Arc<dyn IndexStore>,
    batch: WriteBatch,
}

impl IndexTransaction {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
        }
    }

    /// The committed store this transaction reads through to.
    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn put<T: Table>(&mut self, key: &T::Key, value: &T::Value) -> Result<(), DatabaseError> {
        self.batch.put::<T>(key, value)
    }

    pub fn delete<T: Table>(&mut self, key: &T::Key) {
        self.batch.delete::<T>(key);
    }

    /// Number of buffered operations.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Applies all buffered writes atomically.
    pub fn commit(mut self) -> Result<(), DatabaseError> {
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return Ok(());
        }
        trace!(ops = batch.len(), "committing index transaction");
        self.store.write(batch)
    }

    /// Discards all buffered writes.
    pub fn rollback(mut self) {
        self.batch.clear();
    }
}

impl RawRead for IndexTransaction {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        match self.batch.lookup(table, key) {
            Some(buffered) => Ok(buffered.map(<[u8]>::to_vec)),
            None => self.store.get_raw(table, key),
        }
    }

    fn scan_raw(
        &self,
        table: &'static str,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        self.store.scan_raw(table, query, limit)
    }

    fn count_raw(&self, table: &'static str) -> Result<u64, DatabaseError> {
        self.store.count_raw(table)
    }
}

impl Drop for IndexTransaction {
    fn drop(&mut self) {
        if !self.batch.is_empty() {
            trace!(ops = self.batch.len(), "discarding uncommitted index transaction");
        }
    }
}
