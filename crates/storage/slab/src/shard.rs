//! A single shard file: fixed-size slots addressed by index.
//!
//! Slot layout: `[len: u32 BE][crc32: u32 BE][payload, zero padded]`.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

/// Bytes of slot header preceding the payload.
pub(crate) const HEADER_SIZE: usize = 8;

#[derive(Debug, Default)]
struct Allocator {
    /// Released slots below `next`, reused lowest first.
    free: BTreeSet<u32>,
    /// First slot past the end of the file.
    next: u32,
}

#[derive(Debug)]
pub(crate) struct Shard {
    index: u8,
    file: File,
    free_path: PathBuf,
    stride: usize,
    alloc: Mutex<Allocator>,
}

impl Shard {
    pub(crate) fn open(dir: &Path, index: u8, slot_size: usize) -> io::Result<Self> {
        let path = dir.join(format!("shard_{index:03}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let stride = HEADER_SIZE + slot_size;
        // a trailing partial slot is an interrupted append and is overwritten
        let next = (file.metadata()?.len() / stride as u64) as u32;

        Ok(Self {
            index,
            file,
            free_path: dir.join(format!("free_{index:03}")),
            stride,
            alloc: Mutex::new(Allocator {
                free: BTreeSet::new(),
                next,
            }),
        })
    }

    pub(crate) fn index(&self) -> u8 {
        self.index
    }

    /// Takes the lowest free slot, or appends a new one.
    pub(crate) fn allocate(&self) -> u32 {
        let mut alloc = self.alloc.lock();
        match alloc.free.pop_first() {
            Some(slot) => slot,
            None => {
                let slot = alloc.next;
                alloc.next += 1;
                slot
            }
        }
    }

    /// Returns a slot to the free set.
    pub(crate) fn free(&self, slot: u32) {
        let mut alloc = self.alloc.lock();
        if slot < alloc.next {
            alloc.free.insert(slot);
        }
    }

    /// Writes a full padded slot.
    pub(crate) fn write(&self, slot: u32, data: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.stride);
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(data).to_be_bytes());
        buf.extend_from_slice(data);
        buf.resize(self.stride, 0);
        write_all_at(&self.file, &buf, self.offset(slot))
    }

    /// Reads a full slot into `buf`, returning the number of bytes read.
    /// Fewer than `stride` bytes means the read hit the end of the file.
    pub(crate) fn read(&self, slot: u32, buf: &mut [u8]) -> io::Result<usize> {
        read_full_at(&self.file, buf, self.offset(slot))
    }

    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    /// `(slots, free)` counts.
    pub(crate) fn stats(&self) -> (u32, usize) {
        let alloc = self.alloc.lock();
        (alloc.next, alloc.free.len())
    }

    /// Loads the persisted free set, if any.
    pub(crate) fn load_free(&self) -> io::Result<()> {
        let bytes = match fs::read(&self.free_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut alloc = self.alloc.lock();
        let next = alloc.next;
        alloc.free = bytes
            .chunks_exact(4)
            .filter_map(|b| <[u8; 4]>::try_from(b).ok().map(u32::from_be_bytes))
            .filter(|slot| *slot < next)
            .collect();
        Ok(())
    }

    /// Persists the free set next to the shard file.
    pub(crate) fn persist_free(&self) -> io::Result<()> {
        let bytes: Vec<u8> = {
            let alloc = self.alloc.lock();
            alloc.free.iter().flat_map(|s| s.to_be_bytes()).collect()
        };
        let tmp = self.free_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, &self.free_path)
    }

    /// Rebuilds the free set as every slot not in `used`.
    pub(crate) fn rebuild_free(&self, used: &BTreeSet<u32>) -> usize {
        let mut alloc = self.alloc.lock();
        let next = alloc.next;
        alloc.free = (0..next).filter(|slot| !used.contains(slot)).collect();
        alloc.free.len()
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn offset(&self, slot: u32) -> u64 {
        slot as u64 * self.stride as u64
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = buf.get(n..).unwrap_or_default();
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut read = 0;
    while let Some(rest) = buf.get_mut(read..).filter(|rest| !rest.is_empty()) {
        match read_at(file, rest, offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(read)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
