//! Error types for Swarm API operations.
//!
//! Each error variant contains typed data where callers branch on it, and a
//! message where they only report it.

use vertex_swarm_primitives::ChunkAddress;

/// Error type for Swarm API operations.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Chunk not found locally; the caller may fall back to the network.
    #[error("chunk not found: {address}")]
    ChunkNotFound {
        /// The address of the chunk that wasn't found.
        address: ChunkAddress,
    },

    /// Storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Stored data is corrupt or inconsistent.
    #[error("storage integrity error: {message}")]
    Integrity {
        /// Description of the inconsistency.
        message: String,
    },

    /// Storage is at capacity and nothing could be evicted.
    #[error("storage at capacity: {message}")]
    Capacity {
        /// Description of the exhausted resource.
        message: String,
    },

    /// Invalid chunk data.
    #[error("invalid chunk: {reason}")]
    InvalidChunk {
        /// Description of why the chunk is invalid.
        reason: String,
    },

    /// Postage stamp missing, invalid, or superseded.
    #[error("invalid stamp: {reason}")]
    InvalidStamp {
        /// Description of why the stamp was rejected.
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for Swarm API operations.
pub type SwarmResult<T> = core::result::Result<T, SwarmError>;
