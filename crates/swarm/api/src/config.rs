//! Configuration traits for the local store.
//!
//! CLI args implement these traits directly; the storer extracts what it
//! needs from any implementor.

use core::time::Duration;

/// Configuration for the local store.
pub trait SwarmLocalStoreConfig {
    /// Cache capacity in number of chunks.
    fn cache_chunks(&self) -> u64;

    /// Reserve capacity in number of chunks.
    fn reserve_chunks(&self) -> u64;

    /// Number of blob store shard files.
    fn shards(&self) -> u8;

    /// Number of background workers applying cache access updates.
    fn cache_workers(&self) -> usize;

    /// Capacity of the buffer feeding cache access updates. Updates arriving
    /// while it is full are dropped.
    fn cache_update_buffer(&self) -> usize;

    /// Interval between periodic reserve maintenance runs.
    fn reserve_wakeup_interval(&self) -> Duration;

    /// Number of chunks evicted per transaction during a sweep.
    fn sweep_batch_size(&self) -> usize;

    /// Whether the index lives in memory rather than on disk.
    fn in_memory_index(&self) -> bool {
        false
    }
}
