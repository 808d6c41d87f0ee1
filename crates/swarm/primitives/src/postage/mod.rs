//! Postage: batches of prepaid storage and the stamps issued against them.

mod batch;
mod stamp;
mod stamper;

pub use batch::{Batch, BatchId};
pub use stamp::{POSTAGE_STAMP_SIZE, PostageStamp, to_bucket};
pub use stamper::BatchStamper;

use alloy_primitives::{Address, SignatureError};

/// Errors raised while issuing or validating postage stamps.
#[derive(Debug, thiserror::Error)]
pub enum PostageError {
    #[error("incorrect size, received {0} bytes, expected {1} bytes")]
    IncorrectSize(usize, usize),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("signer error: {0}")]
    Signer(#[from] alloy_signer::Error),

    #[error("batch depth {depth} must exceed bucket depth {bucket_depth}")]
    InvalidDepth { depth: u8, bucket_depth: u8 },

    #[error("stamp bucket {actual} does not match chunk bucket {expected}")]
    BucketMismatch { expected: u32, actual: u32 },

    #[error("stamp slot {slot} exceeds bucket capacity {capacity}")]
    SlotOutOfRange { slot: u32, capacity: u64 },

    #[error("stamp signed by {recovered}, batch owned by {owner}")]
    OwnerMismatch { owner: Address, recovered: Address },

    #[error("bucket {0} is full on an immutable batch")]
    BucketFull(u32),
}
