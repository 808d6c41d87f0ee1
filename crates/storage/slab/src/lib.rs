//! Sharded blob store.
//!
//! Payloads live in fixed-size slots spread over `N` shard files. Each write
//! goes to the next shard in round-robin order and takes that shard's lowest
//! free slot, appending when none is free. A slot carries its payload length
//! and a CRC32 so corrupt or mismatched reads are detected.
//!
//! Released slots are not reusable immediately: they wait in a limbo until
//! every [`ReadGuard`] that was open at release time has been dropped, so a
//! reader that resolved a location just before a delete committed can still
//! read it.
//!
//! Free sets are persisted on [`Slab::close`]. A dirty marker written on open
//! and removed on close detects unclean shutdowns; after one,
//! [`Slab::needs_recovery`] is set and the owner must call [`Slab::recover`]
//! with every location it still references.

mod reclaim;
mod shard;

use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use reclaim::Reclaimer;
use shard::{HEADER_SIZE, Shard};

const DIRTY_MARKER: &str = ".dirty";

/// Position of a payload: shard, slot within the shard and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub shard: u8,
    pub slot: u32,
    pub length: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.shard, self.slot, self.length)
    }
}

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum SlabError {
    /// Payload larger than a slot.
    #[error("payload of {size} bytes exceeds slot size {max}")]
    TooLarge { size: usize, max: usize },

    /// Location names a shard that does not exist.
    #[error("no shard for location {0}")]
    InvalidLocation(Location),

    /// The slot ended before a full read, twice.
    #[error("short read at {location}: {read} of {expected} bytes")]
    ShortRead {
        location: Location,
        read: usize,
        expected: usize,
    },

    /// Stored length differs from the location's length.
    #[error("length mismatch at {location}: slot holds {stored} bytes")]
    LengthMismatch { location: Location, stored: u32 },

    /// Payload checksum does not match the slot header.
    #[error("checksum mismatch at {0}")]
    Checksum(Location),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SlabError {
    /// Whether the error means stored data is corrupt or inconsistent.
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::InvalidLocation(_)
                | Self::ShortRead { .. }
                | Self::LengthMismatch { .. }
                | Self::Checksum(_)
        )
    }
}

/// Per-shard occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    pub shard: u8,
    /// Slots the shard file spans.
    pub slots: u32,
    /// Slots available for reuse.
    pub free: usize,
}

/// Blob store occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabStats {
    pub slot_size: usize,
    pub shards: Vec<ShardStats>,
    /// Released slots waiting for readers to finish.
    pub pending_reclaim: usize,
}

impl SlabStats {
    /// Slots currently holding a payload or awaiting reclamation.
    pub fn used(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots as u64 - s.free as u64)
            .sum()
    }
}

/// Keeps released slots from being reused while held.
#[must_use]
#[derive(Debug)]
pub struct ReadGuard<'a> {
    slab: &'a Slab,
    epoch: u64,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let ready = self.slab.reclaim.exit(self.epoch);
        self.slab.free_all(ready);
    }
}

/// Sharded blob store.
#[derive(Debug)]
pub struct Slab {
    dir: PathBuf,
    slot_size: usize,
    shards: Vec<Shard>,
    next_shard: AtomicUsize,
    reclaim: Reclaimer,
    needs_recovery: AtomicBool,
}

impl Slab {
    /// Opens or creates a blob store in `dir` with `shards` shard files and
    /// slots of `slot_size` payload bytes.
    pub fn open(dir: impl AsRef<Path>, shards: u8, slot_size: usize) -> Result<Self, SlabError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let shards = shards.max(1);
        let shards = (0..shards)
            .map(|index| Shard::open(&dir, index, slot_size))
            .collect::<Result<Vec<_>, _>>()?;

        let dirty = dir.join(DIRTY_MARKER);
        let needs_recovery = dirty.exists();
        if needs_recovery {
            warn!(dir = %dir.display(), "blob store was not closed cleanly, free slots need recovery");
        } else {
            for shard in &shards {
                shard.load_free()?;
            }
        }
        fs::write(&dirty, [])?;

        let slab = Self {
            dir,
            slot_size,
            shards,
            next_shard: AtomicUsize::new(0),
            reclaim: Reclaimer::default(),
            needs_recovery: AtomicBool::new(needs_recovery),
        };
        debug!(dir = %slab.dir.display(), shards = slab.shards.len(), slot_size, "opened blob store");
        Ok(slab)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Whether free sets must be rebuilt with [`recover`](Self::recover).
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery.load(Ordering::Acquire)
    }

    /// Rebuilds every shard's free set from the locations still in use.
    pub fn recover(&self, used: impl IntoIterator<Item = Location>) -> Result<(), SlabError> {
        let mut per_shard = vec![BTreeSet::new(); self.shards.len()];
        for location in used {
            per_shard
                .get_mut(location.shard as usize)
                .ok_or(SlabError::InvalidLocation(location))?
                .insert(location.slot);
        }

        let mut freed = 0;
        for (shard, used) in self.shards.iter().zip(&per_shard) {
            freed += shard.rebuild_free(used);
        }
        self.needs_recovery.store(false, Ordering::Release);
        info!(freed, "recovered blob store free slots");
        Ok(())
    }

    /// Stores `data` in a fresh slot.
    pub fn write(&self, data: &[u8]) -> Result<Location, SlabError> {
        if data.len() > self.slot_size {
            return Err(SlabError::TooLarge {
                size: data.len(),
                max: self.slot_size,
            });
        }

        let index = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let shard = self
            .shards
            .get(index)
            .ok_or(SlabError::Io(io::ErrorKind::NotFound.into()))?;
        let slot = shard.allocate();
        let location = Location {
            shard: shard.index(),
            slot,
            length: data.len() as u32,
        };

        if let Err(err) = shard.write(slot, data) {
            shard.free(slot);
            return Err(err.into());
        }

        counter!("storage.slab.writes").increment(1);
        Ok(location)
    }

    /// Registers a reader. Slots released while the guard is held stay
    /// readable until it is dropped.
    pub fn read_guard(&self) -> ReadGuard<'_> {
        ReadGuard {
            slab: self,
            epoch: self.reclaim.enter(),
        }
    }

    /// Reads the payload at `location`. A short read is retried once.
    pub fn read(&self, location: &Location) -> Result<Vec<u8>, SlabError> {
        let shard = self.shard(location)?;
        let mut buf = vec![0u8; shard.stride()];

        let mut read = shard.read(location.slot, &mut buf)?;
        if read < buf.len() {
            debug!(%location, read, "short blob read, retrying");
            read = shard.read(location.slot, &mut buf)?;
        }
        if read < buf.len() {
            return Err(SlabError::ShortRead {
                location: *location,
                read,
                expected: buf.len(),
            });
        }

        let header = |range: std::ops::Range<usize>| {
            buf.get(range)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(u32::from_be_bytes)
                .unwrap_or_default()
        };
        let stored = header(0..4);
        let checksum = header(4..HEADER_SIZE);

        if stored != location.length || stored as usize > self.slot_size {
            return Err(SlabError::LengthMismatch {
                location: *location,
                stored,
            });
        }

        let end = HEADER_SIZE + stored as usize;
        buf.truncate(end);
        let payload = buf.split_off(HEADER_SIZE);
        if crc32fast::hash(&payload) != checksum {
            return Err(SlabError::Checksum(*location));
        }

        counter!("storage.slab.reads").increment(1);
        Ok(payload)
    }

    /// Releases committed locations. Slots become reusable once no reader
    /// that started before this call is still active.
    pub fn release(&self, locations: impl IntoIterator<Item = Location>) {
        let ready = self.reclaim.release(locations);
        self.free_all(ready);
        gauge!("storage.slab.pending_reclaim").set(self.reclaim.pending() as f64);
    }

    /// Frees locations that were never committed and so never visible to
    /// readers, such as allocations of a rolled back transaction.
    pub fn discard(&self, locations: impl IntoIterator<Item = Location>) {
        self.free_all(locations);
    }

    pub fn stats(&self) -> SlabStats {
        SlabStats {
            slot_size: self.slot_size,
            shards: self
                .shards
                .iter()
                .map(|shard| {
                    let (slots, free) = shard.stats();
                    ShardStats {
                        shard: shard.index(),
                        slots,
                        free,
                    }
                })
                .collect(),
            pending_reclaim: self.reclaim.pending(),
        }
    }

    /// Persists free sets, syncs shard files and clears the dirty marker.
    ///
    /// Must only be called once no readers or writers remain.
    pub fn close(&self) -> Result<(), SlabError> {
        let pending = self.reclaim.drain_all();
        self.free_all(pending);

        for shard in &self.shards {
            shard.sync()?;
            if !self.needs_recovery() {
                shard.persist_free()?;
            }
        }

        // free sets are unknown until recovered, so keep the marker
        if !self.needs_recovery() {
            match fs::remove_file(self.dir.join(DIRTY_MARKER)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        debug!(dir = %self.dir.display(), "closed blob store");
        Ok(())
    }

    fn shard(&self, location: &Location) -> Result<&Shard, SlabError> {
        self.shards
            .get(location.shard as usize)
            .ok_or(SlabError::InvalidLocation(*location))
    }

    fn free_all(&self, locations: impl IntoIterator<Item = Location>) {
        for location in locations {
            if let Some(shard) = self.shards.get(location.shard as usize) {
                shard.free(location.slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 2, 64).unwrap();

        let a = slab.write(b"alpha").unwrap();
        let b = slab.write(b"beta").unwrap();

        // round robin across shards
        assert_ne!(a.shard, b.shard);
        assert_eq!(slab.read(&a).unwrap(), b"alpha");
        assert_eq!(slab.read(&b).unwrap(), b"beta");
    }

    #[test]
    fn test_too_large() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 1, 4).unwrap();
        assert_matches!(slab.write(b"12345"), Err(SlabError::TooLarge { size: 5, max: 4 }));
    }

    #[test]
    fn test_released_slot_reused_after_readers_finish() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        let first = slab.write(b"first").unwrap();

        let guard = slab.read_guard();
        slab.release([first]);

        // the old slot is still readable and not handed out
        let second = slab.write(b"second").unwrap();
        assert_ne!(second.slot, first.slot);
        assert_eq!(slab.read(&first).unwrap(), b"first");

        drop(guard);
        let third = slab.write(b"third").unwrap();
        assert_eq!(third.slot, first.slot);
    }

    #[test]
    fn test_discard_is_immediate() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        let _guard = slab.read_guard();
        let loc = slab.write(b"tentative").unwrap();
        slab.discard([loc]);
        assert_eq!(slab.write(b"next").unwrap().slot, loc.slot);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        let loc = slab.write(b"payload").unwrap();

        let wrong_len = Location { length: 3, ..loc };
        assert_matches!(slab.read(&wrong_len), Err(SlabError::LengthMismatch { stored: 7, .. }));

        let mut bytes = fs::read(dir.path().join("shard_000")).unwrap();
        bytes[HEADER_SIZE] ^= 0xff;
        fs::write(dir.path().join("shard_000"), bytes).unwrap();
        let err = slab.read(&loc).unwrap_err();
        assert!(err.is_integrity());
        assert_matches!(err, SlabError::Checksum(_));
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = tempdir().unwrap();
        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        let ghost = Location {
            shard: 0,
            slot: 9,
            length: 1,
        };
        assert_matches!(slab.read(&ghost), Err(SlabError::ShortRead { read: 0, .. }));
        assert_matches!(
            slab.read(&Location { shard: 4, ..ghost }),
            Err(SlabError::InvalidLocation(_))
        );
    }

    #[test]
    fn test_clean_close_persists_free_slots() {
        let dir = tempdir().unwrap();
        let freed = {
            let slab = Slab::open(dir.path(), 1, 16).unwrap();
            let a = slab.write(b"a").unwrap();
            slab.write(b"b").unwrap();
            slab.release([a]);
            slab.close().unwrap();
            a
        };

        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        assert!(!slab.needs_recovery());
        assert_eq!(slab.write(b"c").unwrap().slot, freed.slot);
    }

    #[test]
    fn test_unclean_shutdown_recovers_from_used_set() {
        let dir = tempdir().unwrap();
        let kept = {
            let slab = Slab::open(dir.path(), 1, 16).unwrap();
            slab.write(b"a").unwrap();
            let kept = slab.write(b"b").unwrap();
            slab.write(b"c").unwrap();
            kept
        };

        let slab = Slab::open(dir.path(), 1, 16).unwrap();
        assert!(slab.needs_recovery());
        slab.recover([kept]).unwrap();
        assert!(!slab.needs_recovery());

        let stats = slab.stats();
        assert_eq!(stats.shards[0].slots, 3);
        assert_eq!(stats.shards[0].free, 2);
        assert_eq!(slab.write(b"d").unwrap().slot, 0);
    }
}
