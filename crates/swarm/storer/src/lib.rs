//! Storer node local store.
//!
//! Chunk payloads live in a sharded slab blob store; every index (retrieval,
//! cache order, reserve bins, stamps, pins) lives in one typed index store.
//! All mutations go through a [`Transaction`] obtained from [`Storage`], so
//! index writes and blob writes land together or not at all.
//!
//! - [`chunkstore`]: reference-counted chunk records over the blob store
//! - [`cache`]: bounded LRU of chunks outside the reserve
//! - [`reserve`]: radius-bounded, stamp-validated chunks near the base address
//! - [`pinning`]: chunks kept regardless of cache or reserve eviction
//! - [`validate`](mod@validate): offline cross-check of indexes and blobs
//! - [`LocalStore`]: the facade wiring these together with background workers

pub mod cache;
pub mod chunkstore;
mod db;
pub mod error;
pub mod events;
mod metrics;
pub mod migration;
pub mod pinning;
pub mod reserve;
pub mod transaction;
pub mod validate;

pub use db::{INDEX_FILE, LocalStore, Options, SLAB_DIR, StoreInfo, open_index};
pub use error::{ConflictReason, StorerError, StorerResult};
pub use events::{EventEmitter, StorerEvent};
pub use reserve::{PutOutcome, SweepReport};
pub use transaction::{Storage, Transaction};
pub use validate::{Problem, ValidationReport, validate};

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static LAST_NANOS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock nanoseconds since the unix epoch, strictly increasing across
/// calls within the process.
pub(crate) fn now_nanos() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64);
    let mut last = LAST_NANOS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_NANOS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_nanos_strictly_increases() {
        let mut previous = now_nanos();
        for _ in 0..10_000 {
            let next = now_nanos();
            assert!(next > previous);
            previous = next;
        }
    }
}
