//! Durable per-segment metadata.
//!
//! `queue.meta` is a memory-mapped table with one slot per segment:
//!
//! ```text
//! header (64 bytes)
//!   0..4   magic 'DQMT'
//!   4..8   version
//!   8..12  segment count
//!   12..16 slot capacity
//! slot i (48 bytes, at 64 + i * 48)
//!   0..8   start offset (global)
//!   8..16  message count
//!   16..24 end offset (bytes written in the segment)
//!   24..32 last write time, ns since UNIX epoch
//!   32..36 crc32 of bytes 0..32
//! ```
//!
//! All integers are little-endian. Updates land in the shared mapping as soon
//! as they are made; [`QueueMeta::close`] forces them to disk.

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const META_FILE: &str = "queue.meta";
pub const META_MAGIC: u32 = 0x544D_5144; // 'DQMT'
pub const META_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 48;
const SLOT_PAYLOAD: usize = 32;
const INITIAL_SLOTS: usize = 64;

const COUNT_OFFSET: usize = 8;
const CAPACITY_OFFSET: usize = 12;

/// Descriptor of one segment as of its last completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileMeta {
    pub start_offset: u64,
    pub msg_count: u64,
    pub end_offset: u64,
    pub last_write_ns: u64,
}

impl FileMeta {
    /// Global offset one past the segment's last committed byte.
    pub fn global_end(&self) -> u64 {
        self.start_offset + self.end_offset
    }

    fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.start_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.msg_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.end_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_write_ns.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..SLOT_PAYLOAD]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let word = |at: usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[32..36]);
        if crc32fast::hash(&buf[0..SLOT_PAYLOAD]) != u32::from_le_bytes(crc) {
            return Err(Error::CorruptMetadata("segment slot checksum mismatch"));
        }
        Ok(Self {
            start_offset: word(0),
            msg_count: word(8),
            end_offset: word(16),
            last_write_ns: word(24),
        })
    }
}

struct MetaState {
    mmap: MmapFile,
    capacity: usize,
    files: Vec<FileMeta>,
}

impl MetaState {
    fn write_slot(&self, index: usize, meta: &FileMeta) -> Result<()> {
        self.mmap
            .write_at(HEADER_SIZE + index * SLOT_SIZE, &meta.encode())
    }

    fn write_u32(&self, at: usize, value: u32) -> Result<()> {
        self.mmap.write_at(at, &value.to_le_bytes())
    }

    fn grow(&mut self) -> Result<()> {
        let capacity = self.capacity * 2;
        self.mmap.truncate(file_len(capacity))?;
        self.write_u32(CAPACITY_OFFSET, capacity as u32)?;
        self.capacity = capacity;
        Ok(())
    }
}

/// The queue's segment table.
pub struct QueueMeta {
    path: PathBuf,
    state: RwLock<MetaState>,
    #[cfg(test)]
    failing_updates: std::sync::atomic::AtomicUsize,
}

impl QueueMeta {
    /// Load `<dir>/queue.meta`, creating an empty table if it is missing.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        let state = if path.exists() {
            load(MmapFile::open(&path)?)?
        } else {
            create(&path)?
        };
        Ok(Self::with_state(path, state))
    }

    /// Load an existing `<dir>/queue.meta` without write access.
    ///
    /// Fails with [`Error::QueueNotFound`] if there is no table; nothing is
    /// created. Every mutating call on the result fails with
    /// [`Error::ReadOnly`].
    pub fn open_read_only(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILE);
        if !path.is_file() {
            return Err(Error::QueueNotFound(dir.to_path_buf()));
        }
        let state = load(MmapFile::open_read_only(&path)?)?;
        Ok(Self::with_state(path, state))
    }

    fn with_state(path: PathBuf, state: MetaState) -> Self {
        Self {
            path,
            state: RwLock::new(state),
            #[cfg(test)]
            failing_updates: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `update_file_stat` fail.
    #[cfg(test)]
    pub(crate) fn fail_next_updates(&self, count: usize) {
        self.failing_updates
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_files(&self) -> Result<usize> {
        Ok(self.read()?.files.len())
    }

    pub fn file_meta(&self, index: u32) -> Result<Option<FileMeta>> {
        Ok(self.read()?.files.get(index as usize).copied())
    }

    pub fn files(&self) -> Result<Vec<FileMeta>> {
        Ok(self.read()?.files.clone())
    }

    /// Global offset one past the last committed byte of the queue.
    pub fn end_offset(&self) -> Result<u64> {
        Ok(self.read()?.files.last().map_or(0, FileMeta::global_end))
    }

    /// Find the segment whose committed range contains `offset`.
    pub fn locate(&self, offset: u64) -> Result<Option<(u32, FileMeta)>> {
        let state = self.read()?;
        let after = state
            .files
            .partition_point(|meta| meta.start_offset <= offset);
        let Some(index) = after.checked_sub(1) else {
            return Ok(None);
        };
        let meta = state.files[index];
        if offset < meta.global_end() {
            Ok(Some((index as u32, meta)))
        } else {
            Ok(None)
        }
    }

    /// Register a new, empty segment starting at `start_offset`.
    pub fn add_file(&self, start_offset: u64) -> Result<u32> {
        let mut state = self.write()?;
        if state.files.len() == state.capacity {
            state.grow()?;
        }
        let index = state.files.len();
        let meta = FileMeta {
            start_offset,
            last_write_ns: now_ns(),
            ..FileMeta::default()
        };
        state.write_slot(index, &meta)?;
        state.write_u32(COUNT_OFFSET, (index + 1) as u32)?;
        state.files.push(meta);
        Ok(index as u32)
    }

    /// Record a completed batch of `added_msgs` records on segment `index`.
    pub fn update_file_stat(
        &self,
        index: u32,
        added_msgs: u64,
        end_offset: u64,
        last_write_ns: u64,
    ) -> Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .failing_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Io(std::io::Error::other("injected update failure")));
            }
        }
        let mut state = self.write()?;
        let mut meta = *state
            .files
            .get(index as usize)
            .ok_or(Error::CorruptMetadata("update for unknown segment"))?;
        meta.msg_count += added_msgs;
        meta.end_offset = end_offset;
        meta.last_write_ns = last_write_ns;
        // Only a slot that reached the mapping is reflected in memory, so a
        // failed update can be retried as is.
        state.write_slot(index as usize, &meta)?;
        state.files[index as usize] = meta;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.read()?.mmap.flush_async()
    }

    /// Force all updates to disk. Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let state = self.read()?;
        state.mmap.flush_sync()?;
        state.mmap.sync()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MetaState>> {
        self.state
            .read()
            .map_err(|_| Error::CorruptMetadata("meta lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MetaState>> {
        self.state
            .write()
            .map_err(|_| Error::CorruptMetadata("meta lock poisoned"))
    }
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn file_len(capacity: usize) -> usize {
    HEADER_SIZE + capacity * SLOT_SIZE
}

fn create(path: &Path) -> Result<MetaState> {
    let tmp_path = path.with_extension("meta.tmp");
    let mmap = MmapFile::create(&tmp_path, file_len(INITIAL_SLOTS))?;
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&META_VERSION.to_le_bytes());
    header[CAPACITY_OFFSET..CAPACITY_OFFSET + 4]
        .copy_from_slice(&(INITIAL_SLOTS as u32).to_le_bytes());
    mmap.write_at(0, &header)?;
    mmap.flush_sync()?;
    mmap.sync()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(MetaState {
        mmap,
        capacity: INITIAL_SLOTS,
        files: Vec::new(),
    })
}

fn load(mmap: MmapFile) -> Result<MetaState> {
    if mmap.len() < HEADER_SIZE {
        return Err(Error::CorruptMetadata("queue.meta too small"));
    }
    let header = mmap.range(0, HEADER_SIZE)?;
    let field = |at: usize| -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&header[at..at + 4]);
        u32::from_le_bytes(bytes)
    };
    if field(0) != META_MAGIC {
        return Err(Error::CorruptMetadata("queue.meta magic mismatch"));
    }
    if field(4) != META_VERSION {
        return Err(Error::CorruptMetadata("queue.meta version mismatch"));
    }
    let count = field(COUNT_OFFSET) as usize;
    let capacity = field(CAPACITY_OFFSET) as usize;
    if count > capacity || mmap.len() < file_len(capacity) {
        return Err(Error::CorruptMetadata("queue.meta slot table truncated"));
    }

    let mut files = Vec::with_capacity(count);
    for index in 0..count {
        let slot = mmap.range(HEADER_SIZE + index * SLOT_SIZE, SLOT_SIZE)?;
        files.push(FileMeta::decode(slot)?);
    }
    Ok(MetaState {
        mmap,
        capacity,
        files,
    })
}
