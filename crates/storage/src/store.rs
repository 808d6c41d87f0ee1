//! Backend traits and the typed read surface.

use std::{collections::BTreeMap, fmt::Debug, ops::ControlFlow};

use crate::{
    Compress, DatabaseError, Decode, Decompress, Encode, ITERATE_PAGE_SIZE, Query, Table,
    table::successor,
};

/// Raw, byte-level reads. Implemented by backends and by transactions.
pub trait RawRead: Send + Sync {
    /// Point lookup of an encoded key.
    fn get_raw(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Up to `limit` entries matching `query`, in ascending key order.
    fn scan_raw(
        &self,
        table: &'static str,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError>;

    /// Number of entries in a table.
    fn count_raw(&self, table: &'static str) -> Result<u64, DatabaseError>;
}

/// A storage backend for the index store.
///
/// Backends apply a [`WriteBatch`] atomically: readers observe either none or
/// all of it. Reads never block on writes for longer than a batch apply.
pub trait IndexStore: RawRead + Debug {
    /// Atomically applies every operation in `batch`.
    fn write(&self, batch: WriteBatch) -> Result<(), DatabaseError>;

    /// Flushes and releases backend resources.
    fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Buffered writes, keyed by table and encoded key. Later writes to the same
/// key replace earlier ones.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: BTreeMap<(&'static str, Vec<u8>), Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_raw(&mut self, table: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert((table, key), Some(value));
    }

    pub fn delete_raw(&mut self, table: &'static str, key: Vec<u8>) {
        self.ops.insert((table, key), None);
    }

    /// Typed put.
    pub fn put<T: Table>(&mut self, key: &T::Key, value: &T::Value) -> Result<(), DatabaseError> {
        self.put_raw(T::NAME, key.clone().encode().into(), value.compress()?);
        Ok(())
    }

    /// Typed delete.
    pub fn delete<T: Table>(&mut self, key: &T::Key) {
        self.delete_raw(T::NAME, key.clone().encode().into());
    }

    /// Buffered state of a key: `None` if untouched, `Some(None)` if deleted.
    pub fn lookup(&self, table: &'static str, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops
            .get(&(table, key.to_vec()))
            .map(|value| value.as_deref())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Operations in table then key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[u8], Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|((table, key), value)| (*table, key.as_slice(), value.as_deref()))
    }

    /// Consumes the batch into its operations.
    pub fn into_ops(self) -> impl Iterator<Item = (&'static str, Vec<u8>, Option<Vec<u8>>)> {
        self.ops
            .into_iter()
            .map(|((table, key), value)| (table, key, value))
    }
}

/// Typed reads over any [`RawRead`].
pub trait IndexRead: RawRead {
    /// Reads one record.
    fn get<T: Table>(&self, key: &T::Key) -> Result<Option<T::Value>, DatabaseError> {
        self.get_raw(T::NAME, key.clone().encode().as_ref())?
            .map(|value| T::Value::decompress(&value))
            .transpose()
    }

    /// Whether a record exists.
    fn has<T: Table>(&self, key: &T::Key) -> Result<bool, DatabaseError> {
        Ok(self.get_raw(T::NAME, key.clone().encode().as_ref())?.is_some())
    }

    /// Number of records in a table.
    fn count<T: Table>(&self) -> Result<u64, DatabaseError> {
        self.count_raw(T::NAME)
    }

    /// Up to `limit` records matching `query`.
    fn page<T: Table>(
        &self,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(T::Key, T::Value)>, DatabaseError> {
        self.scan_raw(T::NAME, query, limit)?
            .into_iter()
            .map(|(k, v)| Ok((T::Key::decode_owned(k)?, T::Value::decompress(&v)?)))
            .collect()
    }

    /// First record matching `query`.
    fn first<T: Table>(&self, query: &Query) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
        Ok(self.page::<T>(query, 1)?.into_iter().next())
    }

    /// Calls `f` for each record matching `query` in ascending key order until
    /// it returns [`ControlFlow::Break`] or an error.
    ///
    /// Records are fetched in pages so no backend lock or read transaction is
    /// held while `f` runs. The iteration can therefore be restarted from any
    /// key with [`Query::start_at`].
    fn iterate<T, E, F>(&self, query: &Query, mut f: F) -> Result<(), E>
    where
        T: Table,
        E: From<DatabaseError>,
        F: FnMut(T::Key, T::Value) -> Result<ControlFlow<()>, E>,
    {
        let mut query = query.clone();
        loop {
            let page = self.scan_raw(T::NAME, &query, ITERATE_PAGE_SIZE)?;
            let exhausted = page.len() < ITERATE_PAGE_SIZE;
            let next = match page.last() {
                Some((key, _)) => successor(key),
                None => return Ok(()),
            };

            for (key, value) in page {
                let key = T::Key::decode_owned(key)?;
                let value = T::Value::decompress(&value)?;
                if f(key, value)?.is_break() {
                    return Ok(());
                }
            }

            if exhausted {
                return Ok(());
            }
            query = query.start_at_raw(next);
        }
    }
}

impl<R: RawRead + ?Sized> IndexRead for R {}
