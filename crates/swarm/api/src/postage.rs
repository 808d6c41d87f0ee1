//! Postage collaborators: stamp issuing and batch lookup.

use std::collections::HashMap;

use alloy_signer::SignerSync;
use auto_impl::auto_impl;
use parking_lot::RwLock;
use vertex_swarm_primitives::{
    Batch, BatchId, BatchStamper, Chunk, ChunkAddress, PostageError, PostageStamp,
};

/// Issues postage stamps for chunks.
pub trait Stamper: Send + Sync {
    /// The batch stamps are issued against.
    fn batch_id(&self) -> BatchId;

    /// Issue a stamp binding `address` to this stamper's batch.
    fn stamp(&self, address: &ChunkAddress) -> Result<PostageStamp, PostageError>;

    /// Stamp a chunk, replacing any stamp it carries.
    fn stamp_chunk(&self, chunk: Chunk) -> Result<Chunk, PostageError> {
        let stamp = self.stamp(chunk.address())?;
        Ok(chunk.with_stamp(stamp))
    }
}

impl<S: SignerSync + Send + Sync> Stamper for BatchStamper<S> {
    fn batch_id(&self) -> BatchId {
        *self.batch().id()
    }

    fn stamp(&self, address: &ChunkAddress) -> Result<PostageStamp, PostageError> {
        BatchStamper::stamp(self, address)
    }
}

/// Postage batches known to the node.
#[auto_impl(&, Arc)]
pub trait BatchStore: Send + Sync {
    /// Look up a batch by id. `None` if unknown or expired.
    fn batch(&self, id: &BatchId) -> Option<Batch>;
}

/// In-memory [`BatchStore`].
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: RwLock<HashMap<BatchId, Batch>>,
}

impl MemoryBatchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a batch.
    pub fn insert(&self, batch: Batch) {
        self.batches.write().insert(*batch.id(), batch);
    }

    /// Remove a batch, returning it if present.
    pub fn remove(&self, id: &BatchId) -> Option<Batch> {
        self.batches.write().remove(id)
    }

    /// Number of known batches.
    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    /// Whether no batches are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BatchStore for MemoryBatchStore {
    fn batch(&self, id: &BatchId) -> Option<Batch> {
        self.batches.read().get(id).cloned()
    }
}
