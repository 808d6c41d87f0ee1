//! Bounded chunk cache with approximate LRU eviction.
//!
//! Cached chunks hold one chunk-store reference each. Entries are indexed
//! twice: by address (to find an entry's access time) and by
//! `(access time, address)` (to find the oldest entries). Access time
//! updates after reads go through a bounded buffer drained by a small
//! worker pool; when the buffer is full the update is dropped, so recency
//! is best effort. A background evictor removes the oldest entries whenever
//! the population exceeds capacity.
//!
//! A chunk is never cached and reserved at the same time: reserve admission
//! takes over the cache entry's reference, and reserve eviction hands it
//! back.

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use vertex_storage::{IndexRead, Query, tables};
use vertex_swarm_primitives::{Chunk, ChunkAddress};

use crate::{
    chunkstore,
    error::{StorerError, StorerResult},
    events::EventEmitter,
    metrics::StorerMetrics,
    now_nanos,
    reserve::ReserveEntry,
    transaction::{Storage, Transaction},
};

tables! {
    /// Last access time per cached chunk, nanoseconds since the unix epoch.
    pub CacheEntry: ChunkAddress => u64 = "cache_entry";
    /// Cached chunks ordered by last access.
    pub CacheOrder: (u64, ChunkAddress) => () = "cache_order";
}

/// Entries removed per eviction transaction.
const EVICT_BATCH: u64 = 1000;

/// Bounded auxiliary index over the chunk store.
#[derive(Debug)]
pub struct Cache {
    storage: Storage,
    capacity: u64,
    size: Arc<AtomicU64>,
    updates: mpsc::Sender<ChunkAddress>,
    updates_rx: Mutex<Option<mpsc::Receiver<ChunkAddress>>>,
    dropped_updates: AtomicU64,
    evict: Arc<Notify>,
    events: EventEmitter,
    metrics: StorerMetrics,
}

impl Cache {
    /// Creates the cache over `storage`, counting the entries already stored.
    pub fn new(
        storage: Storage,
        capacity: u64,
        update_buffer: usize,
        events: EventEmitter,
    ) -> StorerResult<Self> {
        let size = storage.index().count::<CacheEntry>()?;
        let (updates, updates_rx) = mpsc::channel(update_buffer.max(1));
        let metrics = storage.metrics().clone();
        metrics.cache_size.set(size as f64);
        debug!(size, capacity, "cache initialised");

        Ok(Self {
            storage,
            capacity,
            size: Arc::new(AtomicU64::new(size)),
            updates,
            updates_rx: Mutex::new(Some(updates_rx)),
            dropped_updates: AtomicU64::new(0),
            evict: Arc::new(Notify::new()),
            events,
            metrics,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of cached chunks as of the last commit.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Access updates dropped so far because the update buffer was full.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    pub fn contains(&self, address: &ChunkAddress) -> StorerResult<bool> {
        Ok(self.storage.index().has::<CacheEntry>(address)?)
    }

    /// Caches a chunk. A chunk already cached or reserved is left as is.
    /// Returns whether an entry was added.
    pub fn put(&self, tx: &mut Transaction, chunk: &Chunk) -> StorerResult<bool> {
        let address = chunk.address();
        if tx.index().has::<CacheEntry>(address)? || tx.index().has::<ReserveEntry>(address)? {
            trace!(%address, "chunk already held, not caching");
            return Ok(false);
        }

        chunkstore::put(tx, chunk)?;
        self.insert_entry(tx, address)?;
        Ok(true)
    }

    /// Hands a chunk-store reference to the cache, e.g. on reserve eviction.
    pub fn demote(&self, tx: &mut Transaction, address: &ChunkAddress) -> StorerResult<()> {
        if tx.index().has::<CacheEntry>(address)? {
            // already cached, so the handed reference is surplus
            chunkstore::delete(tx, address)?;
            return Ok(());
        }
        self.insert_entry(tx, address)
    }

    /// Removes a cache entry while keeping its chunk-store reference, which
    /// passes to the caller. Returns whether an entry existed.
    pub fn remove_for_promotion(
        &self,
        tx: &mut Transaction,
        address: &ChunkAddress,
    ) -> StorerResult<bool> {
        let Some(accessed) = tx.index().get::<CacheEntry>(address)? else {
            return Ok(false);
        };
        tx.index_mut().delete::<CacheEntry>(address);
        tx.index_mut().delete::<CacheOrder>(&(accessed, *address));

        let size = self.size.clone();
        let gauge = self.metrics.cache_size.clone();
        tx.on_commit(move || {
            let now = size.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
            gauge.set(now as f64);
        });
        trace!(%address, "cache entry promoted");
        Ok(true)
    }

    /// Records a read of `address`. Best effort: dropped when the update
    /// buffer is full.
    pub fn touch(&self, address: ChunkAddress) {
        self.metrics.cache_hits_total.increment(1);
        match self.updates.try_send(address) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_updates.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_updates_dropped_total.increment(1);
                trace!(%address, "cache access update dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Moves an entry to the most recent position. Entries evicted since the
    /// access are skipped.
    pub fn update_access(&self, tx: &mut Transaction, address: &ChunkAddress) -> StorerResult<()> {
        let Some(accessed) = tx.index().get::<CacheEntry>(address)? else {
            return Ok(());
        };
        let now = now_nanos().max(accessed + 1);
        tx.index_mut().delete::<CacheOrder>(&(accessed, *address));
        tx.index_mut().put::<CacheOrder>(&(now, *address), &())?;
        tx.index_mut().put::<CacheEntry>(address, &now)?;
        Ok(())
    }

    /// Evicts least recently accessed entries until the population is at or
    /// below capacity. Returns the number of evicted entries.
    pub async fn evict(&self, cancel: &CancellationToken) -> StorerResult<usize> {
        let mut evicted = 0;
        while self.size() > self.capacity {
            let excess = (self.size() - self.capacity).min(EVICT_BATCH) as usize;
            let oldest = self
                .storage
                .index()
                .page::<CacheOrder>(&Query::all(), excess)?;
            if oldest.is_empty() {
                // counter ahead of the index, resync
                let stored = self.storage.index().count::<CacheEntry>()?;
                warn!(counted = self.size(), stored, "cache size out of sync");
                self.size.store(stored, Ordering::Release);
                break;
            }

            let removed = self
                .storage
                .run(cancel, |tx| self.evict_entries(tx, &oldest))
                .await?;
            evicted += removed;
            if removed == 0 {
                break;
            }
        }

        if evicted > 0 {
            debug!(evicted, size = self.size(), "cache evicted");
            self.metrics.cache_evicted_total.increment(evicted as u64);
            self.events.cache_evicted(evicted);
        }
        Ok(evicted)
    }

    fn evict_entries(
        &self,
        tx: &mut Transaction,
        entries: &[((u64, ChunkAddress), ())],
    ) -> StorerResult<usize> {
        let mut removed = 0;
        for ((accessed, address), ()) in entries {
            // skip entries touched or promoted since the page was read
            if tx.index().get::<CacheEntry>(address)? != Some(*accessed) {
                continue;
            }
            tx.index_mut().delete::<CacheEntry>(address);
            tx.index_mut().delete::<CacheOrder>(&(*accessed, *address));
            match chunkstore::delete(tx, address) {
                Ok(_) => {}
                Err(StorerError::NotFound(_)) => {
                    warn!(%address, "cached chunk missing from chunk store");
                }
                Err(err) => return Err(err),
            }
            removed += 1;
        }

        if removed > 0 {
            let size = self.size.clone();
            let gauge = self.metrics.cache_size.clone();
            tx.on_commit(move || {
                let now = size
                    .fetch_sub(removed as u64, Ordering::AcqRel)
                    .saturating_sub(removed as u64);
                gauge.set(now as f64);
            });
        }
        Ok(removed)
    }

    /// Calls `f` for every cached address, least recently accessed first.
    pub fn iterate<F>(&self, mut f: F) -> StorerResult<()>
    where
        F: FnMut(ChunkAddress, u64) -> StorerResult<ControlFlow<()>>,
    {
        self.storage
            .index()
            .iterate::<CacheOrder, StorerError, _>(&Query::all(), |(accessed, address), ()| {
                f(address, accessed)
            })
    }

    /// Spawns the access update workers and the evictor.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken, workers: usize) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if let Some(rx) = self.updates_rx.lock().take() {
            handles.push(tokio::spawn(self.clone().run_updates(
                rx,
                cancel.clone(),
                workers.max(1),
            )));
        }
        handles.push(tokio::spawn(self.clone().run_evictor(cancel)));
        // evict anything left over capacity by a previous run
        self.evict.notify_one();
        handles
    }

    fn insert_entry(&self, tx: &mut Transaction, address: &ChunkAddress) -> StorerResult<()> {
        let now = now_nanos();
        tx.index_mut().put::<CacheEntry>(address, &now)?;
        tx.index_mut().put::<CacheOrder>(&(now, *address), &())?;

        let size = self.size.clone();
        let evict = self.evict.clone();
        let gauge = self.metrics.cache_size.clone();
        let capacity = self.capacity;
        tx.on_commit(move || {
            let now = size.fetch_add(1, Ordering::AcqRel) + 1;
            gauge.set(now as f64);
            if now > capacity {
                evict.notify_one();
            }
        });
        trace!(%address, "chunk cached");
        Ok(())
    }

    async fn run_updates(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ChunkAddress>,
        cancel: CancellationToken,
        workers: usize,
    ) {
        let permits = Arc::new(Semaphore::new(workers));
        loop {
            let address = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                address = rx.recv() => match address {
                    Some(address) => address,
                    None => break,
                },
            };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let cache = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = cache
                    .storage
                    .run(&cancel, |tx| cache.update_access(tx, &address))
                    .await;
                match result {
                    Ok(()) | Err(StorerError::Cancelled) => {}
                    Err(err) => warn!(%address, %err, "cache access update failed"),
                }
                drop(permit);
            });
        }
        // wait for in-flight updates
        let _ = permits.acquire_many(workers as u32).await;
        debug!("cache update workers stopped");
    }

    async fn run_evictor(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.evict.notified() => {}
            }
            match self.evict(&cancel).await {
                Ok(_) | Err(StorerError::Cancelled) => {}
                Err(err) if err.is_integrity() => error!(%err, "cache eviction failed"),
                Err(err) => warn!(%err, "cache eviction failed"),
            }
        }
        debug!("cache evictor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::StorerEvent;
    use tempfile::TempDir;
    use vertex_storage::MemoryStore;
    use vertex_storage_slab::Slab;
    use vertex_swarm_primitives::MAX_CHUNK_DATA_SIZE;

    fn cache(capacity: u64, buffer: usize) -> (TempDir, Arc<Cache>) {
        let dir = tempfile::tempdir().unwrap();
        let slab = Arc::new(Slab::open(dir.path(), 2, MAX_CHUNK_DATA_SIZE).unwrap());
        let storage = Storage::new(Arc::new(MemoryStore::new()), slab);
        let cache = Cache::new(storage, capacity, buffer, EventEmitter::default()).unwrap();
        (dir, Arc::new(cache))
    }

    fn chunk(i: u8) -> Chunk {
        Chunk::content(&[i; 32]).unwrap()
    }

    async fn put(cache: &Cache, chunk: &Chunk) -> bool {
        cache
            .storage
            .run(&CancellationToken::new(), |tx| cache.put(tx, chunk))
            .await
            .unwrap()
    }

    fn order(cache: &Cache) -> Vec<ChunkAddress> {
        let mut out = Vec::new();
        cache
            .iterate(|address, _| {
                out.push(address);
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_dir, cache) = cache(10, 8);
        let c = chunk(1);
        assert!(put(&cache, &c).await);
        assert!(!put(&cache, &c).await);

        assert_eq!(cache.size(), 1);
        assert!(cache.contains(c.address()).unwrap());
        assert_eq!(chunkstore::refs(cache.storage.index().as_ref(), c.address()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_first() {
        let (_dir, cache) = cache(2, 8);
        let chunks: Vec<_> = (0..4).map(chunk).collect();
        for c in &chunks {
            put(&cache, c).await;
        }
        assert_eq!(cache.size(), 4);

        let mut events = cache.events.subscribe();
        assert_eq!(cache.evict(&CancellationToken::new()).await.unwrap(), 2);

        assert_eq!(cache.size(), 2);
        assert_eq!(order(&cache), vec![*chunks[2].address(), *chunks[3].address()]);
        let index = cache.storage.index().as_ref();
        assert!(!chunkstore::has(index, chunks[0].address()).unwrap());
        assert!(chunkstore::has(index, chunks[3].address()).unwrap());
        assert_eq!(events.recv().await.unwrap(), StorerEvent::CacheEvicted { count: 2 });
    }

    #[tokio::test]
    async fn test_access_update_moves_entry_to_back() {
        let (_dir, cache) = cache(10, 8);
        let a = chunk(1);
        let b = chunk(2);
        put(&cache, &a).await;
        put(&cache, &b).await;

        cache
            .storage
            .run(&CancellationToken::new(), |tx| cache.update_access(tx, a.address()))
            .await
            .unwrap();

        assert_eq!(order(&cache), vec![*b.address(), *a.address()]);
    }

    #[tokio::test]
    async fn test_full_update_buffer_drops_updates() {
        let (_dir, cache) = cache(2, 1);
        let a = chunk(1);
        let b = chunk(2);
        put(&cache, &a).await;
        put(&cache, &b).await;

        // no workers are running: the first touch fills the buffer and the
        // second is dropped without waiting
        cache.touch(*b.address());
        cache.touch(*a.address());
        assert_eq!(cache.dropped_updates(), 1);

        let mut rx = cache.updates_rx.lock().take().unwrap();
        let mut drained = Vec::new();
        while let Ok(address) = rx.try_recv() {
            cache
                .storage
                .run(&CancellationToken::new(), |tx| cache.update_access(tx, &address))
                .await
                .unwrap();
            drained.push(address);
        }
        assert_eq!(drained, vec![*b.address()]);
        assert_eq!(order(&cache), vec![*a.address(), *b.address()]);

        // `a` is still the oldest and goes first
        let c = chunk(3);
        put(&cache, &c).await;
        assert_eq!(cache.evict(&CancellationToken::new()).await.unwrap(), 1);
        assert!(!cache.contains(a.address()).unwrap());
        assert!(cache.contains(b.address()).unwrap());
        assert!(cache.contains(c.address()).unwrap());
    }

    #[tokio::test]
    async fn test_promotion_keeps_chunk() {
        let (_dir, cache) = cache(10, 8);
        let c = chunk(7);
        put(&cache, &c).await;

        let promoted = cache
            .storage
            .run(&CancellationToken::new(), |tx| cache.remove_for_promotion(tx, c.address()))
            .await
            .unwrap();

        assert!(promoted);
        assert_eq!(cache.size(), 0);
        assert!(!cache.contains(c.address()).unwrap());
        assert!(chunkstore::has(cache.storage.index().as_ref(), c.address()).unwrap());
    }

    #[tokio::test]
    async fn test_background_workers_evict_and_update() {
        let (_dir, cache) = cache(1, 8);
        let cancel = CancellationToken::new();
        let handles = cache.spawn(cancel.clone(), 2);

        let a = chunk(1);
        put(&cache, &a).await;
        cache.touch(*a.address());
        put(&cache, &chunk(2)).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.size() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.size(), 1);
    }
}
