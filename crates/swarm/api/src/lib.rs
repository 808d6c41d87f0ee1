//! Swarm API - collaborator interfaces of the local store.
//!
//! The storer talks to the rest of a node only through the narrow traits
//! defined here:
//!
//! - [`ChunkGetter`] / [`ChunkPutter`] - async chunk access used by
//!   retrieval, push-sync and upload pipelines
//! - [`Stamper`] - issues postage stamps for chunks
//! - [`BatchStore`] - postage batches known to the node, consulted when
//!   validating stamps before reserve admission
//! - [`SwarmLocalStoreConfig`] - configuration the storer is built from
//!
//! Errors surface to collaborators as [`SwarmError`].

#![warn(missing_docs)]

mod chunk;
mod config;
mod error;
mod postage;

pub use chunk::*;
pub use config::*;
pub use error::*;
pub use postage::*;

// Re-export chunk types for convenience
pub use vertex_swarm_primitives::{
    Batch, BatchId, Chunk, ChunkAddress, OverlayAddress, PostageError, PostageStamp,
};
