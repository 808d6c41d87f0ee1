use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use super::PostageError;
use crate::CHUNK_SIZE;

pub type BatchId = B256;

/// A postage batch: prepaid capacity to stamp `2^depth` chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// The unique identifier of the batch, generally `H(nonce|owner)`.
    id: BatchId,
    /// The address that owns the batch and can sign stamps for it.
    owner: Address,
    /// Determines the number of chunks that can be signed by the batch. (2^depth)
    depth: u8,
    /// Number of address bits that select the bucket a stamp falls in.
    bucket_depth: u8,
    /// Immutable batches never overwrite slots once a bucket is full.
    immutable: bool,
}

impl Batch {
    /// Creates a batch, checking that `depth` exceeds `bucket_depth`.
    pub fn new(
        id: BatchId,
        owner: Address,
        depth: u8,
        bucket_depth: u8,
        immutable: bool,
    ) -> Result<Self, PostageError> {
        if depth <= bucket_depth || bucket_depth > 32 || depth > 63 {
            return Err(PostageError::InvalidDepth {
                depth,
                bucket_depth,
            });
        }
        Ok(Self {
            id,
            owner,
            depth,
            bucket_depth,
            immutable,
        })
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn bucket_depth(&self) -> u8 {
        self.bucket_depth
    }

    pub fn immutable(&self) -> bool {
        self.immutable
    }

    /// Returns the maximum number of collisions possible in a bucket.
    #[must_use]
    pub const fn max_collisions(&self) -> u64 {
        1u64 << (self.depth - self.bucket_depth)
    }

    /// Returns the number of chunks in the batch (2^depth).
    pub const fn chunks(depth: u8) -> u64 {
        1u64 << depth
    }

    /// Returns the number of bytes that may be stored in the batch.
    pub const fn size(depth: u8) -> u64 {
        Self::chunks(depth) * CHUNK_SIZE as u64
    }
}
