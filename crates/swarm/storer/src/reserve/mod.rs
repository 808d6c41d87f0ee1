//! Capacity-bounded reserve of chunks near the node's overlay address.
//!
//! Every reserved chunk sits in the bin given by its proximity to the base
//! address. Admission requires a postage stamp; one reserve chunk exists per
//! `(batch, stamp index)`, and a newer stamp for the same index displaces
//! the older chunk. When the population exceeds capacity a sweep (see
//! [`Reserve::sweep`]) evicts farthest bins first, oldest first within a
//! bin, and raises the storage radius.
//!
//! Indexes kept per reserved chunk:
//!
//! - [`ReserveEntry`]: address to bin, bin id and stamp
//! - [`ReserveOrder`]: `(bin, inserted_at, address)` eviction order
//! - [`ChunkBin`]: `(bin, bin_id)` for resumable bin enumeration
//! - [`BatchIndex`]: `(batch, bin, address)` for batch eviction
//! - [`StampIndex`]: `(batch, stamp index)` to the chunk holding it

mod sweep;

pub use sweep::SweepReport;

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vertex_storage::{IndexRead, Query, postcard_value, tables};
use vertex_swarm_primitives::{
    BatchId, Chunk, ChunkAddress, MAX_PO, OverlayAddress, PostageStamp, Proximity,
};

use crate::{
    cache::Cache,
    chunkstore,
    error::{ConflictReason, StorerError, StorerResult},
    events::EventEmitter,
    metrics::StorerMetrics,
    now_nanos,
    transaction::{Storage, Transaction},
};

/// Number of reserve bins.
pub const BINS: usize = MAX_PO as usize + 1;

/// A reserved chunk's placement and stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveItem {
    pub bin: u8,
    pub bin_id: u64,
    /// Admission time, nanoseconds since the unix epoch.
    pub inserted_at: u64,
    /// Stamp in its wire encoding.
    pub stamp: Vec<u8>,
}

impl ReserveItem {
    pub fn stamp(&self) -> StorerResult<PostageStamp> {
        PostageStamp::try_from(self.stamp.as_slice()).map_err(|err| StorerError::Integrity {
            address: None,
            reason: format!("stored stamp unreadable: {err}"),
        })
    }
}

/// Chunk currently holding a stamp index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampItem {
    pub address: ChunkAddress,
    pub timestamp: u64,
}

/// Outcome of the last completed sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochItem {
    /// Completion time, nanoseconds since the unix epoch.
    pub timestamp: u64,
    /// Lowest bin that may hold chunks; the next sweep starts here.
    pub bin: u8,
}

postcard_value!(ReserveItem, StampItem, EpochItem);

tables! {
    /// Reserve membership per chunk.
    pub ReserveEntry: ChunkAddress => ReserveItem = "reserve_entry";
    /// Eviction order: bin, then admission time, then address.
    pub ReserveOrder: (u8, u64, ChunkAddress) => () = "reserve_order";
    /// Chunks by bin and bin id.
    pub ChunkBin: (u8, u64) => ChunkAddress = "reserve_chunk_bin";
    /// Chunks by batch.
    pub BatchIndex: (BatchId, u8, ChunkAddress) => () = "reserve_batch";
    /// Holder of each `(batch, stamp index)`.
    pub StampIndex: (BatchId, u64) => StampItem = "reserve_stamp_index";
    /// Last bin id handed out per bin.
    pub BinIdCounter: u8 => u64 = "reserve_bin_id";
    /// Storage radius.
    pub Radius: () => u8 = "reserve_radius";
    /// Last completed sweep.
    pub Epoch: () => EpochItem = "reserve_epoch";
}

/// Result of a reserve put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk joined the reserve.
    Stored { bin: u8, bin_id: u64 },
    /// The chunk joined the reserve, displacing the holder of its stamp index.
    Replaced {
        bin: u8,
        bin_id: u64,
        previous: ChunkAddress,
    },
    /// The chunk was already reserved.
    Duplicate,
}

#[derive(Debug)]
struct Counters {
    size: AtomicU64,
    bins: [AtomicU64; BINS],
    radius: AtomicU8,
}

impl Counters {
    fn add(&self, bin: u8) {
        self.size.fetch_add(1, Ordering::AcqRel);
        if let Some(count) = self.bins.get(bin as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn remove(&self, bin: u8) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if let Some(count) = self.bins.get(bin as usize) {
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}

/// The reserve.
#[derive(Debug)]
pub struct Reserve {
    storage: Storage,
    base: OverlayAddress,
    capacity: u64,
    sweep_batch: usize,
    counters: Arc<Counters>,
    sweeping: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    events: EventEmitter,
    metrics: StorerMetrics,
}

impl Reserve {
    /// Opens the reserve, loading the radius and bin populations.
    pub fn new(
        storage: Storage,
        base: OverlayAddress,
        capacity: u64,
        sweep_batch: usize,
        events: EventEmitter,
    ) -> StorerResult<Self> {
        let index = storage.index();
        let radius = index.get::<Radius>(&())?.unwrap_or(0);

        let counters = Counters {
            size: AtomicU64::new(0),
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            radius: AtomicU8::new(radius),
        };
        index.iterate::<ReserveOrder, StorerError, _>(&Query::all(), |(bin, _, _), ()| {
            counters.add(bin);
            Ok(ControlFlow::Continue(()))
        })?;

        let metrics = storage.metrics().clone();
        let size = counters.size.load(Ordering::Acquire);
        metrics.reserve_size.set(size as f64);
        metrics.reserve_radius.set(radius as f64);
        debug!(size, capacity, radius, %base, "reserve initialised");

        Ok(Self {
            storage,
            base,
            capacity,
            sweep_batch: sweep_batch.max(1),
            counters: Arc::new(counters),
            sweeping: tokio::sync::Mutex::new(()),
            wake: Arc::new(Notify::new()),
            events,
            metrics,
        })
    }

    pub fn base(&self) -> &OverlayAddress {
        &self.base
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reserve population as of the last commit.
    pub fn size(&self) -> u64 {
        self.counters.size.load(Ordering::Acquire)
    }

    pub fn bin_size(&self, bin: u8) -> u64 {
        self.counters
            .bins
            .get(bin as usize)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Population of every bin, bin 0 first.
    pub fn bin_sizes(&self) -> Vec<u64> {
        self.counters
            .bins
            .iter()
            .map(|count| count.load(Ordering::Acquire))
            .collect()
    }

    /// Minimum bin the reserve currently retains.
    pub fn radius(&self) -> u8 {
        self.counters.radius.load(Ordering::Acquire)
    }

    pub fn is_over_capacity(&self) -> bool {
        self.size() > self.capacity
    }

    /// Bin of `address` relative to the base address.
    pub fn bin_of(&self, address: &ChunkAddress) -> u8 {
        self.base.proximity(address)
    }

    pub fn has(&self, address: &ChunkAddress) -> StorerResult<bool> {
        Ok(self.storage.index().has::<ReserveEntry>(address)?)
    }

    pub fn item(&self, address: &ChunkAddress) -> StorerResult<Option<ReserveItem>> {
        Ok(self.storage.index().get::<ReserveEntry>(address)?)
    }

    /// Admits a stamped chunk.
    ///
    /// The stamp must already be validated against its batch. A chunk
    /// cached before is promoted, taking over the cache's chunk-store
    /// reference. The caller sweeps when [`is_over_capacity`] holds after
    /// the commit.
    ///
    /// [`is_over_capacity`]: Self::is_over_capacity
    pub fn put(&self, tx: &mut Transaction, cache: &Cache, chunk: &Chunk) -> StorerResult<PutOutcome> {
        if self.capacity == 0 {
            return Err(StorerError::Capacity {
                store: "reserve",
                capacity: 0,
            });
        }
        let stamp = chunk.stamp().ok_or(ConflictReason::MissingStamp)?;
        let address = *chunk.address();
        let bin = self.bin_of(&address);
        let radius = self.radius();
        if bin < radius {
            return Err(StorerError::OutOfRadius { bin, radius });
        }
        if tx.index().has::<ReserveEntry>(&address)? {
            trace!(%address, "chunk already reserved");
            return Ok(PutOutcome::Duplicate);
        }

        let stamp_key = (*stamp.batch_id(), stamp.index());
        let mut previous = None;
        if let Some(held) = tx.index().get::<StampIndex>(&stamp_key)? {
            if held.timestamp >= stamp.timestamp() {
                return Err(ConflictReason::StaleStamp.into());
            }
            if self.remove_entry(tx, &held.address)?.is_some() {
                chunkstore::delete(tx, &held.address)?;
            }
            debug!(%address, previous = %held.address, "stamp index displaced");
            previous = Some(held.address);
        }

        if !cache.remove_for_promotion(tx, &address)? {
            chunkstore::put(tx, chunk)?;
        }

        let bin_id = tx.index().get::<BinIdCounter>(&bin)?.unwrap_or(0) + 1;
        let inserted_at = now_nanos();
        let item = ReserveItem {
            bin,
            bin_id,
            inserted_at,
            stamp: Bytes::from(stamp).to_vec(),
        };

        let index = tx.index_mut();
        index.put::<BinIdCounter>(&bin, &bin_id)?;
        index.put::<ReserveEntry>(&address, &item)?;
        index.put::<ReserveOrder>(&(bin, inserted_at, address), &())?;
        index.put::<ChunkBin>(&(bin, bin_id), &address)?;
        index.put::<BatchIndex>(&(stamp_key.0, bin, address), &())?;
        index.put::<StampIndex>(
            &stamp_key,
            &StampItem {
                address,
                timestamp: stamp.timestamp(),
            },
        )?;

        let counters = self.counters.clone();
        let wake = self.wake.clone();
        let events = self.events.clone();
        let metrics = self.metrics.clone();
        let capacity = self.capacity;
        tx.on_commit(move || {
            counters.add(bin);
            let size = counters.size.load(Ordering::Acquire);
            metrics.reserve_puts_total.increment(1);
            metrics.reserve_size.set(size as f64);
            events.bin_updated(bin, bin_id);
            if size > capacity {
                wake.notify_one();
            }
        });
        trace!(%address, bin, bin_id, "chunk reserved");

        Ok(match previous {
            Some(previous) => PutOutcome::Replaced {
                bin,
                bin_id,
                previous,
            },
            None => PutOutcome::Stored { bin, bin_id },
        })
    }

    /// Removes a chunk from every reserve index. The reserve's chunk-store
    /// reference is left to the caller, who either drops it or hands it to
    /// the cache.
    pub fn remove_entry(
        &self,
        tx: &mut Transaction,
        address: &ChunkAddress,
    ) -> StorerResult<Option<ReserveItem>> {
        let Some(item) = tx.index().get::<ReserveEntry>(address)? else {
            return Ok(None);
        };
        let stamp = item.stamp()?;
        let stamp_key = (*stamp.batch_id(), stamp.index());
        let holds_stamp = tx
            .index()
            .get::<StampIndex>(&stamp_key)?
            .is_some_and(|held| held.address == *address);

        let index = tx.index_mut();
        index.delete::<ReserveEntry>(address);
        index.delete::<ReserveOrder>(&(item.bin, item.inserted_at, *address));
        index.delete::<ChunkBin>(&(item.bin, item.bin_id));
        index.delete::<BatchIndex>(&(stamp_key.0, item.bin, *address));
        if holds_stamp {
            index.delete::<StampIndex>(&stamp_key);
        }

        let counters = self.counters.clone();
        let gauge = self.metrics.reserve_size.clone();
        let bin = item.bin;
        tx.on_commit(move || {
            counters.remove(bin);
            gauge.set(counters.size.load(Ordering::Acquire) as f64);
        });
        Ok(Some(item))
    }

    /// Calls `f` with `(bin_id, address)` for chunks in `bin` with a bin id
    /// of at least `from`, in bin id order.
    pub fn iterate_bin<F>(&self, bin: u8, from: u64, mut f: F) -> StorerResult<()>
    where
        F: FnMut(u64, ChunkAddress) -> StorerResult<ControlFlow<()>>,
    {
        let query = Query::prefix(bin).start_at((bin, from));
        self.storage
            .index()
            .iterate::<ChunkBin, StorerError, _>(&query, |(_, bin_id), address| f(bin_id, address))
    }

    /// Last bin id handed out in `bin`.
    pub fn last_bin_id(&self, bin: u8) -> StorerResult<u64> {
        Ok(self.storage.index().get::<BinIdCounter>(&bin)?.unwrap_or(0))
    }

    /// Evicts every reserve chunk stamped by `batch`, dropping the chunks.
    /// Returns the number of evicted chunks.
    pub async fn evict_batch(&self, cancel: &CancellationToken, batch: &BatchId) -> StorerResult<usize> {
        let _sweeping = self.sweeping.lock().await;
        let mut evicted = 0;
        loop {
            let page = self
                .storage
                .index()
                .page::<BatchIndex>(&Query::prefix(*batch), self.sweep_batch)?;
            if page.is_empty() {
                break;
            }

            let removed = self
                .storage
                .run(cancel, |tx| {
                    let mut removed = 0;
                    for ((_, _, address), ()) in &page {
                        if self.remove_entry(tx, address)?.is_some() {
                            chunkstore::delete(tx, address)?;
                            removed += 1;
                        }
                    }
                    Ok(removed)
                })
                .await?;
            evicted += removed;
            if removed == 0 {
                break;
            }
        }

        if evicted > 0 {
            debug!(%batch, evicted, "batch evicted from reserve");
            self.metrics.reserve_evicted_total.increment(evicted as u64);
            self.events.reserve_evicted(evicted, self.radius());
        }
        Ok(evicted)
    }

    /// Last completed sweep, if any.
    pub fn epoch(&self) -> StorerResult<Option<EpochItem>> {
        Ok(self.storage.index().get::<Epoch>(&())?)
    }

    /// Wakes the background worker.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}
