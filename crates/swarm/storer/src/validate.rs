//! Offline consistency check of a local store.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    ops::ControlFlow,
};

use tracing::{debug, warn};
use vertex_storage::{IndexRead, Query};
use vertex_storage_slab::{Location, Slab};
use vertex_swarm_primitives::ChunkAddress;

use crate::{
    cache::CacheEntry,
    chunkstore::RetrievalIndex,
    error::{StorerError, StorerResult},
    pinning::PinCounter,
    reserve::ReserveEntry,
};

/// An inconsistency found by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// The blob behind a chunk record cannot be read back intact.
    UnreadableBlob { address: ChunkAddress, reason: String },
    /// Two chunk records point at the same blob slot.
    SharedLocation {
        location: Location,
        first: ChunkAddress,
        second: ChunkAddress,
    },
    /// A cache, reserve or pin entry names a chunk that is not stored.
    MissingChunk {
        address: ChunkAddress,
        holder: &'static str,
    },
    /// A chunk is both cached and reserved.
    CachedAndReserved { address: ChunkAddress },
    /// The reference count differs from the number of holders.
    RefcountMismatch {
        address: ChunkAddress,
        refcnt: u32,
        holders: u32,
    },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadableBlob { address, reason } => {
                write!(f, "{address}: blob unreadable: {reason}")
            }
            Self::SharedLocation {
                location,
                first,
                second,
            } => write!(f, "{first} and {second} share blob slot {location}"),
            Self::MissingChunk { address, holder } => {
                write!(f, "{address}: {holder} entry without stored chunk")
            }
            Self::CachedAndReserved { address } => write!(f, "{address}: both cached and reserved"),
            Self::RefcountMismatch {
                address,
                refcnt,
                holders,
            } => write!(f, "{address}: refcount {refcnt} but {holders} holders"),
        }
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub chunks: u64,
    pub cached: u64,
    pub reserved: u64,
    pub pinned: u64,
    pub problems: Vec<Problem>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Cross-checks every index against the chunk store and reads every blob.
///
/// Runs against committed state only and must not race with writers.
pub fn validate<R: IndexRead + ?Sized>(index: &R, slab: &Slab) -> StorerResult<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut refcnts: HashMap<ChunkAddress, u32> = HashMap::new();
    let mut locations: HashMap<Location, ChunkAddress> = HashMap::new();

    index.iterate::<RetrievalIndex, StorerError, _>(&Query::all(), |address, item| {
        report.chunks += 1;
        refcnts.insert(address, item.refcnt);
        if let Some(first) = locations.insert(item.location, address) {
            report.problems.push(Problem::SharedLocation {
                location: item.location,
                first,
                second: address,
            });
        }
        if let Err(err) = slab.read(&item.location) {
            report.problems.push(Problem::UnreadableBlob {
                address,
                reason: err.to_string(),
            });
        }
        Ok(ControlFlow::Continue(()))
    })?;

    let mut holders: HashMap<ChunkAddress, u32> = HashMap::new();
    let mut cached = HashSet::new();

    index.iterate::<CacheEntry, StorerError, _>(&Query::all(), |address, _| {
        report.cached += 1;
        cached.insert(address);
        *holders.entry(address).or_default() += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    index.iterate::<ReserveEntry, StorerError, _>(&Query::all(), |address, _| {
        report.reserved += 1;
        if cached.contains(&address) {
            report.problems.push(Problem::CachedAndReserved { address });
        }
        *holders.entry(address).or_default() += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    let mut pinned = HashSet::new();
    index.iterate::<PinCounter, StorerError, _>(&Query::all(), |address, _| {
        report.pinned += 1;
        pinned.insert(address);
        *holders.entry(address).or_default() += 1;
        Ok(ControlFlow::Continue(()))
    })?;

    for (address, &count) in &holders {
        if !refcnts.contains_key(address) {
            let holder = if pinned.contains(address) {
                "pin"
            } else if cached.contains(address) {
                "cache"
            } else {
                "reserve"
            };
            report.problems.push(Problem::MissingChunk {
                address: *address,
                holder,
            });
            continue;
        }
        if let Some(&refcnt) = refcnts.get(address) {
            if refcnt != count {
                report.problems.push(Problem::RefcountMismatch {
                    address: *address,
                    refcnt,
                    holders: count,
                });
            }
        }
    }
    for (address, &refcnt) in &refcnts {
        if !holders.contains_key(address) {
            report.problems.push(Problem::RefcountMismatch {
                address: *address,
                refcnt,
                holders: 0,
            });
        }
    }

    for problem in &report.problems {
        warn!(%problem, "local store inconsistency");
    }
    debug!(
        chunks = report.chunks,
        problems = report.problems.len(),
        "local store validated"
    );
    Ok(report)
}
