//! Chunk access for network-facing collaborators.

use async_trait::async_trait;
use vertex_swarm_primitives::{Chunk, ChunkAddress};

use crate::SwarmResult;

/// Reads chunks.
#[async_trait]
pub trait ChunkGetter: Send + Sync {
    /// Get a chunk by address.
    ///
    /// Returns [`SwarmError::ChunkNotFound`](crate::SwarmError::ChunkNotFound)
    /// when the chunk is absent.
    async fn get(&self, address: &ChunkAddress) -> SwarmResult<Chunk>;
}

/// Stores chunks.
#[async_trait]
pub trait ChunkPutter: Send + Sync {
    /// Store a chunk. Storing an already present chunk succeeds.
    async fn put(&self, chunk: Chunk) -> SwarmResult<()>;
}
