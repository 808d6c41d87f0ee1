//! Swarm local store configuration.

mod args;

pub use args::LocalStoreArgs;

/// Default reserve capacity in chunks (2^22, about 16 GiB of payload).
pub const DEFAULT_RESERVE_CAPACITY: u64 = 1 << 22;

/// Default cache capacity in chunks.
pub const DEFAULT_CACHE_CAPACITY: u64 = 1 << 16;

/// Default number of blob store shards.
pub const DEFAULT_SHARDS: u8 = 32;

/// Default number of cache access update workers.
pub const DEFAULT_CACHE_WORKERS: usize = 8;

/// Default capacity of the cache access update buffer.
pub const DEFAULT_CACHE_UPDATE_BUFFER: usize = 1024;

/// Default interval between periodic reserve maintenance runs, in seconds.
pub const DEFAULT_RESERVE_WAKEUP_SECS: u64 = 300;

/// Default number of chunks evicted per sweep transaction.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 1000;
