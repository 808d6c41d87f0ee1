//! Chunk pinning.
//!
//! A pinned chunk holds one extra chunk-store reference for as long as its
//! pin counter is non-zero, so neither cache nor reserve eviction can
//! remove it.

use tracing::trace;
use vertex_storage::{IndexRead, tables};
use vertex_swarm_primitives::{Chunk, ChunkAddress};

use crate::{
    chunkstore,
    error::{StorerError, StorerResult},
    transaction::Transaction,
};

tables! {
    /// Pin count per chunk.
    pub PinCounter: ChunkAddress => u64 = "pin_counter";
}

/// Pins a chunk, storing it if it is not stored yet. Returns the new count.
pub fn pin(tx: &mut Transaction, chunk: &Chunk) -> StorerResult<u64> {
    let address = chunk.address();
    let count = tx.index().get::<PinCounter>(address)?.unwrap_or(0) + 1;
    if count == 1 {
        chunkstore::put(tx, chunk)?;
    }
    tx.index_mut().put::<PinCounter>(address, &count)?;
    trace!(%address, count, "chunk pinned");
    Ok(count)
}

/// Drops one pin. The last unpin releases the pin's chunk-store reference.
/// Returns the remaining count.
pub fn unpin(tx: &mut Transaction, address: &ChunkAddress) -> StorerResult<u64> {
    let count = tx
        .index()
        .get::<PinCounter>(address)?
        .ok_or(StorerError::NotFound(*address))?;

    if count > 1 {
        tx.index_mut().put::<PinCounter>(address, &(count - 1))?;
        return Ok(count - 1);
    }

    tx.index_mut().delete::<PinCounter>(address);
    chunkstore::delete(tx, address)?;
    trace!(%address, "chunk unpinned");
    Ok(0)
}

pub fn pin_count<R: IndexRead + ?Sized>(index: &R, address: &ChunkAddress) -> StorerResult<u64> {
    Ok(index.get::<PinCounter>(address)?.unwrap_or(0))
}

pub fn is_pinned<R: IndexRead + ?Sized>(index: &R, address: &ChunkAddress) -> StorerResult<bool> {
    Ok(index.has::<PinCounter>(address)?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{cache::Cache, events::EventEmitter, transaction::Storage};
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;
    use vertex_storage::MemoryStore;
    use vertex_storage_slab::Slab;
    use vertex_swarm_primitives::MAX_CHUNK_DATA_SIZE;

    #[tokio::test]
    async fn test_pin_protects_from_cache_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let slab = Arc::new(Slab::open(dir.path(), 1, MAX_CHUNK_DATA_SIZE).unwrap());
        let storage = Storage::new(Arc::new(MemoryStore::new()), slab);
        let cache = Cache::new(storage.clone(), 0, 8, EventEmitter::default()).unwrap();
        let cancel = CancellationToken::new();
        let chunk = Chunk::content(b"pinned").unwrap();

        storage
            .run(&cancel, |tx| {
                cache.put(tx, &chunk)?;
                pin(tx, &chunk)
            })
            .await
            .unwrap();
        assert_eq!(chunkstore::refs(storage.index().as_ref(), chunk.address()).unwrap(), 2);

        assert_eq!(cache.evict(&cancel).await.unwrap(), 1);
        assert!(!cache.contains(chunk.address()).unwrap());
        assert!(chunkstore::has(storage.index().as_ref(), chunk.address()).unwrap());

        storage.run(&cancel, |tx| unpin(tx, chunk.address())).await.unwrap();
        assert!(!chunkstore::has(storage.index().as_ref(), chunk.address()).unwrap());
        assert!(!is_pinned(storage.index().as_ref(), chunk.address()).unwrap());
    }

    #[tokio::test]
    async fn test_pin_counts() {
        let dir = tempfile::tempdir().unwrap();
        let slab = Arc::new(Slab::open(dir.path(), 1, MAX_CHUNK_DATA_SIZE).unwrap());
        let storage = Storage::new(Arc::new(MemoryStore::new()), slab);
        let cancel = CancellationToken::new();
        let chunk = Chunk::content(b"twice").unwrap();

        for expected in 1..=2 {
            let count = storage.run(&cancel, |tx| pin(tx, &chunk)).await.unwrap();
            assert_eq!(count, expected);
        }
        assert_eq!(chunkstore::refs(storage.index().as_ref(), chunk.address()).unwrap(), 1);

        assert_eq!(storage.run(&cancel, |tx| unpin(tx, chunk.address())).await.unwrap(), 1);
        assert_eq!(storage.run(&cancel, |tx| unpin(tx, chunk.address())).await.unwrap(), 0);
        assert_matches!(
            storage.run(&cancel, |tx| unpin(tx, chunk.address())).await,
            Err(StorerError::NotFound(_))
        );
    }
}
