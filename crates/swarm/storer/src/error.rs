//! Storer error types.

use vertex_storage::{DatabaseError, migration::MigrationError};
use vertex_storage_slab::SlabError;
use vertex_swarm_api::SwarmError;
use vertex_swarm_primitives::{ChunkAddress, PostageError};

/// Why a chunk was rejected at the reserve boundary.
#[derive(Debug, thiserror::Error, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConflictReason {
    /// The chunk carries no postage stamp.
    #[error("chunk carries no postage stamp")]
    MissingStamp,

    /// The stamp's batch is unknown or expired.
    #[error("unknown batch")]
    UnknownBatch,

    /// The stamp does not validate against its batch.
    #[error("invalid stamp: {0}")]
    InvalidStamp(#[from] PostageError),

    /// A stamp with the same index and a newer or equal timestamp is stored.
    #[error("stamp superseded by a newer stamp for the same index")]
    StaleStamp,
}

/// Errors from storer operations.
#[derive(Debug, thiserror::Error)]
pub enum StorerError {
    /// Chunk not found locally.
    #[error("chunk not found: {0}")]
    NotFound(ChunkAddress),

    /// Index and blob store disagree, or stored bytes are corrupt.
    #[error("integrity error: {reason}")]
    Integrity {
        address: Option<ChunkAddress>,
        reason: String,
    },

    /// Nothing can be evicted to make room.
    #[error("{store} at capacity ({capacity} chunks)")]
    Capacity { store: &'static str, capacity: u64 },

    /// Chunk rejected at the reserve boundary.
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictReason),

    /// The chunk falls in a bin below the storage radius.
    #[error("chunk in bin {bin} is outside radius {radius}")]
    OutOfRadius { bin: u8, radius: u8 },

    /// Chunk data does not match its address.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Slab(#[from] SlabError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled before it started writing.
    #[error("operation cancelled")]
    Cancelled,
}

impl StorerError {
    pub(crate) fn integrity(address: ChunkAddress, reason: impl Into<String>) -> Self {
        Self::Integrity {
            address: Some(address),
            reason: reason.into(),
        }
    }

    /// Whether retrying the failed operation can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => err.is_transient(),
            Self::Slab(SlabError::Io(_)) => true,
            _ => false,
        }
    }

    /// Whether the error signals corrupt or inconsistent storage.
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Integrity { .. } => true,
            Self::Slab(err) => err.is_integrity(),
            _ => false,
        }
    }
}

impl From<StorerError> for SwarmError {
    fn from(err: StorerError) -> Self {
        match err {
            StorerError::NotFound(address) => Self::ChunkNotFound { address },
            StorerError::Capacity { .. } => Self::Capacity {
                message: err.to_string(),
            },
            StorerError::Conflict(reason) => Self::InvalidStamp {
                reason: reason.to_string(),
            },
            StorerError::InvalidChunk(reason) => Self::InvalidChunk { reason },
            StorerError::OutOfRadius { .. } => Self::InvalidChunk {
                reason: err.to_string(),
            },
            StorerError::Cancelled => Self::Cancelled,
            err if err.is_integrity() => Self::Integrity {
                message: err.to_string(),
            },
            err => Self::Storage {
                message: err.to_string(),
            },
        }
    }
}

/// Result type for storer operations.
pub type StorerResult<T> = Result<T, StorerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_transient_classification() {
        assert!(StorerError::Database(DatabaseError::Io("busy".into())).is_transient());
        assert!(!StorerError::Database(DatabaseError::Decode).is_transient());
        assert!(!StorerError::NotFound(ChunkAddress::ZERO).is_transient());
    }

    #[test]
    fn test_into_swarm_error() {
        assert_matches!(
            SwarmError::from(StorerError::NotFound(ChunkAddress::ZERO)),
            SwarmError::ChunkNotFound { address } if address == ChunkAddress::ZERO
        );
        assert_matches!(
            SwarmError::from(StorerError::integrity(ChunkAddress::ZERO, "missing blob")),
            SwarmError::Integrity { .. }
        );
        assert_matches!(
            SwarmError::from(StorerError::Conflict(ConflictReason::StaleStamp)),
            SwarmError::InvalidStamp { .. }
        );
    }

    #[test]
    fn test_conflict_reason_label() {
        let label: &'static str = (&ConflictReason::UnknownBatch).into();
        assert_eq!(label, "unknown_batch");
    }
}
