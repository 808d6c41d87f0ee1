//! Core primitive types for Ethereum Swarm nodes.
//!
//! This crate provides fundamental types used across the storage stack,
//! kept separate to avoid circular dependencies.
//!
//! # Types
//!
//! - [`SwarmAddress`] - 32-byte address in the Swarm overlay (chunks and nodes)
//! - [`Chunk`] - Content-addressed unit of storage, optionally stamped
//! - [`Batch`], [`PostageStamp`] - Postage batches and the stamps they sign
//! - [`BatchStamper`] - Issues signed stamps for a batch owned by a local key

mod address;
pub mod bmt;
mod chunk;
pub mod postage;
mod proximity;

pub use address::{ChunkAddress, OverlayAddress, SwarmAddress};
pub use chunk::{Chunk, ChunkError};
pub use postage::{Batch, BatchId, BatchStamper, PostageError, PostageStamp};
pub use proximity::{Proximity, proximity};

use alloy_primitives::{Address, B256, Keccak256};

/// Size of a Keccak-256 digest and of every Swarm address.
pub const HASH_SIZE: usize = 32;

/// Size of the little-endian span prefix carried by every chunk.
pub const SPAN_SIZE: usize = 8;

/// Size of a BMT segment.
pub const SEGMENT_SIZE: usize = 32;

/// Maximum payload size of a content-addressed chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Maximum size of a chunk's data (span + payload).
pub const MAX_CHUNK_DATA_SIZE: usize = SPAN_SIZE + CHUNK_SIZE;

/// Highest proximity order tracked for reserve bins.
pub const MAX_PO: u8 = 31;

/// Proximity order used when more precision than [`MAX_PO`] is needed.
pub const EXTENDED_PO: u8 = MAX_PO + 5;

/// Computes overlay address: `keccak256(ethereum_address || network_id || nonce)`.
pub fn compute_overlay(ethereum_address: &Address, network_id: u64, nonce: &B256) -> SwarmAddress {
    let mut hasher = Keccak256::new();
    hasher.update(ethereum_address);
    hasher.update(network_id.to_le_bytes());
    hasher.update(nonce);
    SwarmAddress::from(hasher.finalize())
}
