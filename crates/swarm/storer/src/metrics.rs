//! Storer metrics

use metrics::{Counter, Gauge};

/// Storer metrics
#[derive(Clone, Debug)]
pub(crate) struct StorerMetrics {
    /// Chunks written to the blob store
    pub(crate) chunkstore_writes_total: Counter,
    /// Puts of an already stored chunk
    pub(crate) chunkstore_dedup_total: Counter,
    /// Chunks removed from the blob store
    pub(crate) chunkstore_deletes_total: Counter,
    /// Cache lookups that found a cache entry
    pub(crate) cache_hits_total: Counter,
    /// Chunks evicted from the cache
    pub(crate) cache_evicted_total: Counter,
    /// Access updates dropped because the update buffer was full
    pub(crate) cache_updates_dropped_total: Counter,
    /// Cache population
    pub(crate) cache_size: Gauge,
    /// Chunks admitted to the reserve
    pub(crate) reserve_puts_total: Counter,
    /// Chunks evicted from the reserve
    pub(crate) reserve_evicted_total: Counter,
    /// Reserve population
    pub(crate) reserve_size: Gauge,
    /// Storage radius
    pub(crate) reserve_radius: Gauge,
    /// Committed transactions
    pub(crate) transaction_commits_total: Counter,
    /// Transactions dropped without commit
    pub(crate) transaction_rollbacks_total: Counter,
    /// Transactions retried after a transient failure
    pub(crate) transaction_retries_total: Counter,
}

impl Default for StorerMetrics {
    fn default() -> Self {
        Self {
            chunkstore_writes_total: metrics::counter!("storer.chunkstore.writes_total"),
            chunkstore_dedup_total: metrics::counter!("storer.chunkstore.dedup_total"),
            chunkstore_deletes_total: metrics::counter!("storer.chunkstore.deletes_total"),
            cache_hits_total: metrics::counter!("storer.cache.hits_total"),
            cache_evicted_total: metrics::counter!("storer.cache.evicted_total"),
            cache_updates_dropped_total: metrics::counter!(
                "storer.cache.updates_dropped_total"
            ),
            cache_size: metrics::gauge!("storer.cache.size"),
            reserve_puts_total: metrics::counter!("storer.reserve.puts_total"),
            reserve_evicted_total: metrics::counter!("storer.reserve.evicted_total"),
            reserve_size: metrics::gauge!("storer.reserve.size"),
            reserve_radius: metrics::gauge!("storer.reserve.radius"),
            transaction_commits_total: metrics::counter!("storer.transaction.commits_total"),
            transaction_rollbacks_total: metrics::counter!(
                "storer.transaction.rollbacks_total"
            ),
            transaction_retries_total: metrics::counter!("storer.transaction.retries_total"),
        }
    }
}

impl StorerMetrics {
    /// Increments the rejection counter for a reserve conflict.
    pub(crate) fn inc_reserve_rejected(&self, reason: &'static str) {
        metrics::counter!("storer.reserve.rejected_total", "reason" => reason).increment(1);
    }
}
