//! redb-based index store backend.
//!
//! This crate provides [`RedbStore`], a persistent [`IndexStore`] backed by
//! the redb embedded database. Every index table is a redb table of raw
//! byte keys and values; key ordering is redb's byte-wise ordering, which
//! matches the order-preserving key encodings of `vertex-storage`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use metrics::counter;
use redb::{Database, ReadableTableMetadata, TableDefinition, TableError, TableHandle};
use tracing::debug;
use vertex_storage::{DatabaseError, IndexStore, Query, RawRead, WriteBatch};

fn definition(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Maps any redb error, keeping I/O failures distinguishable as transient.
fn db_err<E: Into<redb::Error>>(err: E) -> DatabaseError {
    match err.into() {
        redb::Error::Io(err) => DatabaseError::Io(err.to_string()),
        other => DatabaseError::Other(other.to_string()),
    }
}

/// redb-based index store.
///
/// Uses redb for ACID-compliant persistent storage. Reads run in their own
/// read transactions and see a consistent snapshot of the last commit.
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl RedbStore {
    /// Open or create an index store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(db_err)?;
        debug!(path = %path.display(), "opened redb index store");
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of all tables that have ever been written.
    pub fn table_names(&self) -> Result<Vec<String>, DatabaseError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        Ok(txn
            .list_tables()
            .map_err(db_err)?
            .map(|handle| handle.name().to_string())
            .collect())
    }
}

impl RawRead for RedbStore {
    fn get_raw(&self, table: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(definition(table)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(db_err(err)),
        };
        Ok(table.get(key).map_err(db_err)?.map(|v| v.value().to_vec()))
    }

    fn scan_raw(
        &self,
        table: &'static str,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(definition(table)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(db_err(err)),
        };

        let mut out = Vec::new();
        for entry in table.range(query.start_bytes()..).map_err(db_err)? {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(db_err)?;
            let key = key.value();
            if !key.starts_with(query.prefix_bytes()) {
                break;
            }
            out.push((key.to_vec(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn count_raw(&self, table: &'static str) -> Result<u64, DatabaseError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        match txn.open_table(definition(table)) {
            Ok(table) => table.len().map_err(db_err),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(err) => Err(db_err(err)),
        }
    }
}

impl IndexStore for RedbStore {
    fn write(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        let mut grouped: BTreeMap<&'static str, Vec<(Vec<u8>, Option<Vec<u8>>)>> = BTreeMap::new();
        for (table, key, value) in batch.into_ops() {
            grouped.entry(table).or_default().push((key, value));
        }

        let txn = self.db.begin_write().map_err(db_err)?;
        for (name, ops) in grouped {
            let mut table = txn.open_table(definition(name)).map_err(db_err)?;
            for (key, value) in ops {
                match value {
                    Some(value) => {
                        table.insert(key.as_slice(), value.as_slice()).map_err(db_err)?;
                    }
                    None => {
                        table.remove(key.as_slice()).map_err(db_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(db_err)?;

        counter!("storage.redb.commits").increment(1);
        Ok(())
    }
}
