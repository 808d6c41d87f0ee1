//! Transaction coordinator.
//!
//! Every mutation of the local store runs inside a [`Transaction`] obtained
//! from [`Storage`]. Holding a transaction holds the store-wide write lock,
//! so there is exactly one writer at a time. Index writes are buffered and
//! applied atomically on [`Transaction::commit`]; blob slots written during
//! the transaction are freed again when it is dropped without committing.
//! Blob slots released by a transaction are handed to the blob store only
//! after the index commit, and the blob store keeps them readable until
//! readers that started earlier are done.
//!
//! Reads do not take the lock. They go straight to [`Storage::index`] and
//! [`Storage::slab`] and observe the last committed state.

use std::{fmt, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vertex_storage::{IndexStore, IndexTransaction};
use vertex_storage_slab::{Location, Slab};

use crate::{
    error::{StorerError, StorerResult},
    metrics::StorerMetrics,
};

type CommitHook = Box<dyn FnOnce() + Send>;

/// Shared handle to the index and blob stores plus the write lock.
#[derive(Clone)]
pub struct Storage {
    index: Arc<dyn IndexStore>,
    slab: Arc<Slab>,
    lock: Arc<Mutex<()>>,
    metrics: StorerMetrics,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("index", &self.index)
            .field("slab", &self.slab.dir())
            .finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(index: Arc<dyn IndexStore>, slab: Arc<Slab>) -> Self {
        Self {
            index,
            slab,
            lock: Arc::new(Mutex::new(())),
            metrics: StorerMetrics::default(),
        }
    }

    /// Committed index state.
    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn slab(&self) -> &Arc<Slab> {
        &self.slab
    }

    pub(crate) fn metrics(&self) -> &StorerMetrics {
        &self.metrics
    }

    /// Waits for the write lock and opens a transaction.
    ///
    /// Returns [`StorerError::Cancelled`] if `cancel` fires first. The lock
    /// is released when the returned transaction is committed or dropped.
    pub async fn new_transaction(&self, cancel: &CancellationToken) -> StorerResult<Transaction> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorerError::Cancelled),
            guard = self.lock.clone().lock_owned() => guard,
        };
        Ok(self.open(guard))
    }

    /// Opens a transaction without waiting. `None` if a writer is active.
    pub fn try_transaction(&self) -> Option<Transaction> {
        let guard = self.lock.clone().try_lock_owned().ok()?;
        Some(self.open(guard))
    }

    /// Runs `f` in a fresh transaction and commits it.
    ///
    /// A transient failure (of `f` or of the commit) rolls back and retries
    /// once; any other error rolls back and is returned as is.
    pub async fn run<T, F>(&self, cancel: &CancellationToken, mut f: F) -> StorerResult<T>
    where
        F: FnMut(&mut Transaction) -> StorerResult<T>,
    {
        let mut retried = false;
        loop {
            let mut tx = self.new_transaction(cancel).await?;
            let result = match f(&mut tx) {
                Ok(value) => tx.commit().map(|()| value),
                Err(err) => {
                    drop(tx);
                    Err(err)
                }
            };

            match result {
                Err(err) if err.is_transient() && !retried => {
                    warn!(%err, "transient transaction failure, retrying");
                    self.metrics.transaction_retries_total.increment(1);
                    retried = true;
                }
                result => return result,
            }
        }
    }

    fn open(&self, guard: OwnedMutexGuard<()>) -> Transaction {
        trace!("transaction opened");
        Transaction {
            index: IndexTransaction::new(self.index.clone()),
            slab: self.slab.clone(),
            allocated: Vec::new(),
            released: Vec::new(),
            on_commit: Vec::new(),
            metrics: self.metrics.clone(),
            committed: false,
            _guard: guard,
        }
    }
}

/// A unit of work against the index and blob stores.
///
/// Dropping a transaction without calling [`commit`](Self::commit) rolls it
/// back, whatever the exit path.
pub struct Transaction {
    index: IndexTransaction,
    slab: Arc<Slab>,
    /// Slots written by this transaction.
    allocated: Vec<Location>,
    /// Slots to release once the index commit succeeds.
    released: Vec<Location>,
    on_commit: Vec<CommitHook>,
    metrics: StorerMetrics,
    committed: bool,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("pending", &self.index.pending())
            .field("allocated", &self.allocated.len())
            .field("released", &self.released.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Index view of this transaction: point reads see buffered writes.
    pub fn index(&self) -> &IndexTransaction {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut IndexTransaction {
        &mut self.index
    }

    pub(crate) fn metrics(&self) -> &StorerMetrics {
        &self.metrics
    }

    /// Writes a payload to a fresh blob slot owned by this transaction.
    pub fn write_blob(&mut self, data: &[u8]) -> StorerResult<Location> {
        let location = self.slab.write(data)?;
        self.allocated.push(location);
        Ok(location)
    }

    pub fn read_blob(&self, location: &Location) -> StorerResult<Vec<u8>> {
        Ok(self.slab.read(location)?)
    }

    /// Schedules a blob slot for release after commit.
    pub fn release_blob(&mut self, location: Location) {
        self.released.push(location);
    }

    /// Registers a callback run after a successful commit, still under the
    /// write lock.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Applies all index writes atomically, then releases blob slots and
    /// runs commit hooks.
    pub fn commit(mut self) -> StorerResult<()> {
        let store = self.index.store().clone();
        let index = std::mem::replace(&mut self.index, IndexTransaction::new(store));
        index.commit()?;
        self.committed = true;

        self.slab.release(std::mem::take(&mut self.released));
        for hook in std::mem::take(&mut self.on_commit) {
            hook();
        }
        self.metrics.transaction_commits_total.increment(1);
        trace!("transaction committed");
        Ok(())
    }

    /// Discards all buffered writes and frees slots written by this
    /// transaction.
    pub fn rollback(self) {}
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if !self.allocated.is_empty() {
            debug!(slots = self.allocated.len(), "rolling back transaction, freeing blob slots");
        }
        self.slab.discard(std::mem::take(&mut self.allocated));
        self.metrics.transaction_rollbacks_total.increment(1);
    }
}
