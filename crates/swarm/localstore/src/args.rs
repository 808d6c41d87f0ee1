//! Local store CLI arguments.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use vertex_swarm_api::SwarmLocalStoreConfig;

use crate::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_UPDATE_BUFFER, DEFAULT_CACHE_WORKERS,
    DEFAULT_RESERVE_CAPACITY, DEFAULT_RESERVE_WAKEUP_SECS, DEFAULT_SHARDS,
    DEFAULT_SWEEP_BATCH_SIZE,
};

/// Cache divisor for storer nodes (smaller cache relative to reserve).
const STORER_CACHE_DIVISOR: u64 = 64;

/// Local store configuration arguments.
#[derive(Debug, Args, Clone, Serialize, Deserialize)]
#[command(next_help_heading = "Local Store")]
#[serde(default)]
pub struct LocalStoreArgs {
    /// Cache capacity in number of chunks.
    #[arg(long = "localstore.cache-chunks", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_chunks: u64,

    /// Reserve capacity in number of chunks.
    #[arg(long = "localstore.reserve-chunks", default_value_t = DEFAULT_RESERVE_CAPACITY)]
    pub reserve_chunks: u64,

    /// Number of blob store shard files.
    #[arg(long = "localstore.shards", default_value_t = DEFAULT_SHARDS)]
    pub shards: u8,

    /// Background workers applying cache access updates.
    #[arg(long = "localstore.cache-workers", default_value_t = DEFAULT_CACHE_WORKERS)]
    pub cache_workers: usize,

    /// Buffered cache access updates before new ones are dropped.
    #[arg(long = "localstore.cache-update-buffer", default_value_t = DEFAULT_CACHE_UPDATE_BUFFER)]
    pub cache_update_buffer: usize,

    /// Seconds between periodic reserve maintenance runs.
    #[arg(
        long = "localstore.reserve-wakeup",
        value_name = "SECS",
        default_value_t = DEFAULT_RESERVE_WAKEUP_SECS
    )]
    pub reserve_wakeup_secs: u64,

    /// Chunks evicted per transaction during a reserve sweep.
    #[arg(long = "localstore.sweep-batch", default_value_t = DEFAULT_SWEEP_BATCH_SIZE)]
    pub sweep_batch_size: usize,

    /// Keep the index in memory (no persistence).
    #[arg(long = "localstore.memory")]
    pub in_memory: bool,
}

impl LocalStoreArgs {
    /// Configuration for a storer node: cache sized relative to the reserve.
    pub fn for_storer(reserve_chunks: u64) -> Self {
        Self {
            cache_chunks: reserve_chunks / STORER_CACHE_DIVISOR,
            reserve_chunks,
            ..Self::default()
        }
    }
}

impl Default for LocalStoreArgs {
    fn default() -> Self {
        Self {
            cache_chunks: DEFAULT_CACHE_CAPACITY,
            reserve_chunks: DEFAULT_RESERVE_CAPACITY,
            shards: DEFAULT_SHARDS,
            cache_workers: DEFAULT_CACHE_WORKERS,
            cache_update_buffer: DEFAULT_CACHE_UPDATE_BUFFER,
            reserve_wakeup_secs: DEFAULT_RESERVE_WAKEUP_SECS,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            in_memory: false,
        }
    }
}

impl SwarmLocalStoreConfig for LocalStoreArgs {
    fn cache_chunks(&self) -> u64 {
        self.cache_chunks
    }

    fn reserve_chunks(&self) -> u64 {
        self.reserve_chunks
    }

    fn shards(&self) -> u8 {
        self.shards
    }

    fn cache_workers(&self) -> usize {
        self.cache_workers
    }

    fn cache_update_buffer(&self) -> usize {
        self.cache_update_buffer
    }

    fn reserve_wakeup_interval(&self) -> Duration {
        Duration::from_secs(self.reserve_wakeup_secs)
    }

    fn sweep_batch_size(&self) -> usize {
        self.sweep_batch_size
    }

    fn in_memory_index(&self) -> bool {
        self.in_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use figment::{
        Figment,
        providers::{Format, Serialized, Toml},
    };

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        localstore: LocalStoreArgs,
    }

    #[test]
    fn test_cli_defaults_match_default() {
        let cli = Cli::parse_from(["vertex"]);
        assert_eq!(cli.localstore.reserve_chunks, DEFAULT_RESERVE_CAPACITY);
        assert_eq!(cli.localstore.cache_workers, DEFAULT_CACHE_WORKERS);
        assert!(!cli.localstore.in_memory);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "vertex",
            "--localstore.reserve-chunks",
            "1000",
            "--localstore.reserve-wakeup",
            "5",
            "--localstore.memory",
        ]);
        assert_eq!(cli.localstore.reserve_chunks(), 1000);
        assert_eq!(cli.localstore.reserve_wakeup_interval(), Duration::from_secs(5));
        assert!(cli.localstore.in_memory_index());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let args: LocalStoreArgs = Figment::from(Serialized::defaults(LocalStoreArgs::default()))
            .merge(Toml::string("cache_chunks = 10\nshards = 4"))
            .extract()
            .unwrap();
        assert_eq!(args.cache_chunks, 10);
        assert_eq!(args.shards, 4);
        assert_eq!(args.sweep_batch_size, DEFAULT_SWEEP_BATCH_SIZE);
    }

    #[test]
    fn test_for_storer_scales_cache() {
        let args = LocalStoreArgs::for_storer(6400);
        assert_eq!(args.cache_chunks, 100);
        assert_eq!(args.reserve_chunks, 6400);
    }
}
