//! Reference-counted chunk store.
//!
//! Maps a chunk address to the blob slot holding its data. Identical chunks
//! are stored once: a repeated put only increments the reference count, and
//! the slot is released when the count drops to zero. The cache, the
//! reserve and pins each hold their own reference.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use tracing::{error, trace};
use vertex_storage::{IndexRead, Query, postcard_value, tables};
use vertex_storage_slab::{Location, Slab};
use vertex_swarm_primitives::{Chunk, ChunkAddress};

use crate::{
    error::{StorerError, StorerResult},
    now_nanos,
    transaction::Transaction,
};

/// Where a chunk's data lives and how many holders reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub location: Location,
    pub refcnt: u32,
    /// First store time, nanoseconds since the unix epoch.
    pub stored_at: u64,
}

postcard_value!(RetrievalItem);

tables! {
    /// Blob location and reference count per chunk.
    pub RetrievalIndex: ChunkAddress => RetrievalItem = "chunkstore_retrieval";
}

/// Stores a chunk, or takes another reference to an already stored one.
/// Returns whether the chunk's data was written.
pub fn put(tx: &mut Transaction, chunk: &Chunk) -> StorerResult<bool> {
    let address = *chunk.address();
    if let Some(mut item) = tx.index().get::<RetrievalIndex>(&address)? {
        item.refcnt += 1;
        tx.index_mut().put::<RetrievalIndex>(&address, &item)?;
        tx.metrics().chunkstore_dedup_total.increment(1);
        trace!(%address, refcnt = item.refcnt, "chunk reference added");
        return Ok(false);
    }

    let location = tx.write_blob(chunk.data())?;
    let item = RetrievalItem {
        location,
        refcnt: 1,
        stored_at: now_nanos(),
    };
    tx.index_mut().put::<RetrievalIndex>(&address, &item)?;
    tx.metrics().chunkstore_writes_total.increment(1);
    trace!(%address, %location, "chunk stored");
    Ok(true)
}

/// Drops one reference. At zero the record is removed and the blob slot
/// released on commit. Returns whether the chunk is gone.
pub fn delete(tx: &mut Transaction, address: &ChunkAddress) -> StorerResult<bool> {
    let mut item = tx
        .index()
        .get::<RetrievalIndex>(address)?
        .ok_or(StorerError::NotFound(*address))?;

    if item.refcnt > 1 {
        item.refcnt -= 1;
        tx.index_mut().put::<RetrievalIndex>(address, &item)?;
        trace!(%address, refcnt = item.refcnt, "chunk reference dropped");
        return Ok(false);
    }

    tx.index_mut().delete::<RetrievalIndex>(address);
    tx.release_blob(item.location);
    tx.metrics().chunkstore_deletes_total.increment(1);
    trace!(%address, location = %item.location, "chunk deleted");
    Ok(true)
}

/// Reads a chunk. The returned chunk carries no stamp.
///
/// An index record whose blob cannot be read is an integrity error, not a
/// miss.
pub fn get<R: IndexRead + ?Sized>(
    index: &R,
    slab: &Slab,
    address: &ChunkAddress,
) -> StorerResult<Chunk> {
    // registered before the lookup so the slot cannot be reused under us
    let _guard = slab.read_guard();
    let item = index
        .get::<RetrievalIndex>(address)?
        .ok_or(StorerError::NotFound(*address))?;

    let data = slab.read(&item.location).map_err(|err| {
        if err.is_integrity() {
            error!(%address, location = %item.location, %err, "chunk blob unreadable");
            StorerError::integrity(*address, err.to_string())
        } else {
            err.into()
        }
    })?;
    Ok(Chunk::new(*address, data))
}

pub fn has<R: IndexRead + ?Sized>(index: &R, address: &ChunkAddress) -> StorerResult<bool> {
    Ok(index.has::<RetrievalIndex>(address)?)
}

/// Current reference count, `0` if absent.
pub fn refs<R: IndexRead + ?Sized>(index: &R, address: &ChunkAddress) -> StorerResult<u32> {
    Ok(index
        .get::<RetrievalIndex>(address)?
        .map_or(0, |item| item.refcnt))
}

/// Number of distinct stored chunks.
pub fn count<R: IndexRead + ?Sized>(index: &R) -> StorerResult<u64> {
    Ok(index.count::<RetrievalIndex>()?)
}

/// Calls `f` for every stored address in ascending order until it breaks.
pub fn iterate_addresses<R, F>(index: &R, mut f: F) -> StorerResult<()>
where
    R: IndexRead + ?Sized,
    F: FnMut(ChunkAddress) -> StorerResult<ControlFlow<()>>,
{
    index.iterate::<RetrievalIndex, StorerError, _>(&Query::all(), |address, _| f(address))
}

/// Every blob location referenced by the index.
pub fn used_locations<R: IndexRead + ?Sized>(index: &R) -> StorerResult<Vec<Location>> {
    let mut used = Vec::new();
    index.iterate::<RetrievalIndex, StorerError, _>(&Query::all(), |_, item| {
        used.push(item.location);
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(used)
}
