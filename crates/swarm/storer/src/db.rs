//! The local store: chunk store, cache, reserve and pins behind one handle.

use std::{fmt, ops::ControlFlow, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vertex_storage::{IndexRead, IndexStore, MemoryStore, migration};
use vertex_storage_redb::RedbStore;
use vertex_storage_slab::{Slab, SlabStats};
use vertex_swarm_api::{BatchStore, ChunkGetter, ChunkPutter, SwarmLocalStoreConfig, SwarmResult};
use vertex_swarm_primitives::{
    BatchId, Chunk, ChunkAddress, MAX_CHUNK_DATA_SIZE, OverlayAddress,
};

use crate::{
    cache::{Cache, CacheEntry},
    chunkstore,
    error::{ConflictReason, StorerError, StorerResult},
    events::{EventEmitter, StorerEvent},
    migration::steps,
    pinning,
    reserve::{PutOutcome, Reserve, ReserveEntry, SweepReport},
    transaction::Storage,
};

/// File name of the persistent index inside the data directory.
pub const INDEX_FILE: &str = "index.redb";

/// Directory of the blob store inside the data directory.
pub const SLAB_DIR: &str = "slab";

/// Local store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub cache_capacity: u64,
    pub reserve_capacity: u64,
    pub shards: u8,
    pub cache_workers: usize,
    pub cache_update_buffer: usize,
    pub reserve_wakeup: Duration,
    pub sweep_batch_size: usize,
    pub in_memory_index: bool,
}

impl Options {
    pub fn from_config(config: &impl SwarmLocalStoreConfig) -> Self {
        Self {
            cache_capacity: config.cache_chunks(),
            reserve_capacity: config.reserve_chunks(),
            shards: config.shards(),
            cache_workers: config.cache_workers(),
            cache_update_buffer: config.cache_update_buffer(),
            reserve_wakeup: config.reserve_wakeup_interval(),
            sweep_batch_size: config.sweep_batch_size(),
            in_memory_index: config.in_memory_index(),
        }
    }
}

/// Point-in-time summary of the local store.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub schema_version: u64,
    pub chunks: u64,
    pub cache_size: u64,
    pub cache_capacity: u64,
    pub reserve_size: u64,
    pub reserve_capacity: u64,
    pub radius: u8,
    /// Reserve population per bin, bin 0 first.
    pub bins: Vec<u64>,
    pub slab: SlabStats,
}

/// Opens the index of a data directory.
pub fn open_index(dir: &Path, in_memory: bool) -> StorerResult<Arc<dyn IndexStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    std::fs::create_dir_all(dir)?;
    Ok(Arc::new(RedbStore::open(dir.join(INDEX_FILE))?))
}

/// Handle to a node's local chunk storage.
pub struct LocalStore {
    storage: Storage,
    cache: Arc<Cache>,
    reserve: Arc<Reserve>,
    batches: Arc<dyn BatchStore>,
    events: EventEmitter,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("storage", &self.storage)
            .field("radius", &self.reserve.radius())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Opens the store in `dir`, migrating the index and recovering the blob
    /// store after an unclean shutdown, then starts the background workers.
    pub async fn open(
        dir: impl AsRef<Path>,
        base: OverlayAddress,
        batches: Arc<dyn BatchStore>,
        options: Options,
    ) -> StorerResult<Self> {
        let dir = dir.as_ref();
        let index = open_index(dir, options.in_memory_index)?;
        let version = migration::migrate(&index, &steps())?;

        let slab = Slab::open(dir.join(SLAB_DIR), options.shards, MAX_CHUNK_DATA_SIZE)?;
        // an in-memory index starts empty, so nothing on disk is referenced
        if options.in_memory_index || slab.needs_recovery() {
            slab.recover(chunkstore::used_locations(index.as_ref())?)?;
        }

        let storage = Storage::new(index, Arc::new(slab));
        let events = EventEmitter::default();
        let cache = Arc::new(Cache::new(
            storage.clone(),
            options.cache_capacity,
            options.cache_update_buffer,
            events.clone(),
        )?);
        let reserve = Arc::new(Reserve::new(
            storage.clone(),
            base,
            options.reserve_capacity,
            options.sweep_batch_size,
            events.clone(),
        )?);

        let cancel = CancellationToken::new();
        let mut workers = cache.spawn(cancel.clone(), options.cache_workers);
        workers.push(reserve.spawn(cache.clone(), cancel.clone(), options.reserve_wakeup));

        info!(
            dir = %dir.display(),
            %base,
            version,
            cache = cache.size(),
            reserve = reserve.size(),
            radius = reserve.radius(),
            "local store opened"
        );

        Ok(Self {
            storage,
            cache,
            reserve,
            batches,
            events,
            cancel,
            workers: Mutex::new(workers),
        })
    }

    /// Transaction coordinator shared by every component.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn reserve(&self) -> &Arc<Reserve> {
        &self.reserve
    }

    /// Caches a content-addressed chunk. Returns whether it was added.
    pub async fn put_cache(&self, chunk: Chunk) -> StorerResult<bool> {
        if !chunk.is_valid_content() {
            return Err(StorerError::InvalidChunk(format!(
                "data does not hash to {}",
                chunk.address()
            )));
        }
        self.storage
            .run(&self.cancel, |tx| self.cache.put(tx, &chunk))
            .await
    }

    /// Reads a chunk. Reserve chunks carry their stamp; cache hits refresh
    /// the entry's access time in the background.
    pub async fn get(&self, address: &ChunkAddress) -> StorerResult<Chunk> {
        let index = self.storage.index();
        let chunk = chunkstore::get(index.as_ref(), self.storage.slab(), address)?;

        if let Some(item) = index.get::<ReserveEntry>(address)? {
            return Ok(chunk.with_stamp(item.stamp()?));
        }
        if index.has::<CacheEntry>(address)? {
            self.cache.touch(*address);
        }
        Ok(chunk)
    }

    pub fn has(&self, address: &ChunkAddress) -> StorerResult<bool> {
        chunkstore::has(self.storage.index().as_ref(), address)
    }

    /// Admits a stamped chunk to the reserve after validating its stamp
    /// against the batch store. Sweeps right away when the reserve overflows.
    pub async fn reserve_put(&self, chunk: Chunk) -> StorerResult<PutOutcome> {
        let result = self.reserve_put_inner(chunk).await;
        if let Err(StorerError::Conflict(reason)) = &result {
            self.storage.metrics().inc_reserve_rejected(reason.into());
        }
        result
    }

    async fn reserve_put_inner(&self, chunk: Chunk) -> StorerResult<PutOutcome> {
        if !chunk.is_valid_content() {
            return Err(StorerError::InvalidChunk(format!(
                "data does not hash to {}",
                chunk.address()
            )));
        }
        let stamp = chunk.stamp().ok_or(ConflictReason::MissingStamp)?;
        let batch = self
            .batches
            .batch(stamp.batch_id())
            .ok_or(ConflictReason::UnknownBatch)?;
        stamp
            .verify(chunk.address(), &batch)
            .map_err(ConflictReason::InvalidStamp)?;

        let outcome = self
            .storage
            .run(&self.cancel, |tx| self.reserve.put(tx, &self.cache, &chunk))
            .await?;

        if self.reserve.is_over_capacity() {
            self.reserve
                .sweep(&self.cancel, &self.cache, self.reserve.radius())
                .await?;
        }
        Ok(outcome)
    }

    /// Pins a chunk, storing it if needed. Returns the pin count.
    pub async fn pin(&self, chunk: Chunk) -> StorerResult<u64> {
        self.storage
            .run(&self.cancel, |tx| pinning::pin(tx, &chunk))
            .await
    }

    /// Drops one pin. Returns the remaining count.
    pub async fn unpin(&self, address: &ChunkAddress) -> StorerResult<u64> {
        self.storage
            .run(&self.cancel, |tx| pinning::unpin(tx, address))
            .await
    }

    pub fn pin_count(&self, address: &ChunkAddress) -> StorerResult<u64> {
        pinning::pin_count(self.storage.index().as_ref(), address)
    }

    /// Subscribes to radius and eviction events. Slow subscribers miss
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<StorerEvent> {
        self.events.subscribe()
    }

    /// Sweeps the reserve towards `target`.
    pub async fn sweep(&self, target: u8) -> StorerResult<SweepReport> {
        self.reserve.sweep(&self.cancel, &self.cache, target).await
    }

    /// Evicts every reserve chunk of an expired batch.
    pub async fn evict_batch(&self, batch: &BatchId) -> StorerResult<usize> {
        self.reserve.evict_batch(&self.cancel, batch).await
    }

    /// Enumerates reserve chunks of `bin` from bin id `from` onwards. Bin
    /// ids only grow, so a caller can resume from the last id it saw plus
    /// one.
    pub fn iterate_bin<F>(&self, bin: u8, from: u64, f: F) -> StorerResult<()>
    where
        F: FnMut(u64, ChunkAddress) -> StorerResult<ControlFlow<()>>,
    {
        self.reserve.iterate_bin(bin, from, f)
    }

    pub fn radius(&self) -> u8 {
        self.reserve.radius()
    }

    pub fn reserve_size(&self) -> u64 {
        self.reserve.size()
    }

    pub fn cache_size(&self) -> u64 {
        self.cache.size()
    }

    pub fn info(&self) -> StorerResult<StoreInfo> {
        let index = self.storage.index();
        Ok(StoreInfo {
            schema_version: migration::version(index.as_ref())?,
            chunks: chunkstore::count(index.as_ref())?,
            cache_size: self.cache.size(),
            cache_capacity: self.cache.capacity(),
            reserve_size: self.reserve.size(),
            reserve_capacity: self.reserve.capacity(),
            radius: self.reserve.radius(),
            bins: self.reserve.bin_sizes(),
            slab: self.storage.slab().stats(),
        })
    }

    /// Stops the workers and closes the blob and index stores.
    pub async fn close(&self) -> StorerResult<()> {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(%err, "local store worker panicked");
            }
        }

        // wait for any in-flight writer
        drop(self.storage.new_transaction(&CancellationToken::new()).await?);
        self.storage.slab().close()?;
        self.storage.index().close()?;
        debug!("local store closed");
        Ok(())
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ChunkGetter for LocalStore {
    async fn get(&self, address: &ChunkAddress) -> SwarmResult<Chunk> {
        Ok(LocalStore::get(self, address).await?)
    }
}

#[async_trait]
impl ChunkPutter for LocalStore {
    /// Stamped chunks go to the reserve, falling back to the cache when
    /// they are outside the radius. Unstamped chunks are cached.
    async fn put(&self, chunk: Chunk) -> SwarmResult<()> {
        if chunk.stamp().is_some() {
            match self.reserve_put(chunk.clone()).await {
                Ok(_) => return Ok(()),
                Err(StorerError::OutOfRadius { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.put_cache(chunk.without_stamp()).await?;
        Ok(())
    }
}
