//! The read path.
//!
//! [`Queue::read`] serves readers inside the writing process. [`QueueReader`]
//! maps an existing queue read-only for tooling: it never creates files,
//! starts threads or shrinks segments, and sees the segment table as of
//! [`QueueReader::open`].

use std::path::{Path, PathBuf};

use crate::meta::FileMeta;
use crate::queue::Store;
use crate::segment::{decode_len, LEN_PREFIX};
use crate::{Error, Queue, Result};

impl Queue {
    /// Read consecutive records starting at global `offset`.
    ///
    /// Returns up to `max(stores.len(), 1)` payloads, following records
    /// across segment boundaries and stopping at the committed end. Payloads
    /// are copied into the caller's buffers in order (each cleared first), so
    /// their allocations are reused; fresh buffers are allocated once `stores`
    /// runs out. Only ranges already recorded in metadata are read, so this
    /// is safe while writes are in progress.
    ///
    /// # Errors
    ///
    /// - `Error::OffsetOutOfRange`: `offset` is past the committed end
    /// - `Error::Corrupt`: `offset` is not a record boundary
    /// - `Error::AlreadyClosing` / `Error::AlreadyClosed` / `Error::NotInitialized`
    pub fn read(&self, offset: u64, stores: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        self.check_close_state()?;
        self.store()?.read(offset, stores)
    }
}

/// Read-only view of a queue on disk.
pub struct QueueReader {
    directory: PathBuf,
    store: Store,
}

impl QueueReader {
    /// Map the queue rooted at `directory`.
    ///
    /// Fails with [`Error::QueueNotFound`] when `directory` holds no
    /// `queue.meta`.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        let store = Store::open_read_only(&directory)?;
        Ok(Self { directory, store })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Same contract as [`Queue::read`].
    pub fn read(&self, offset: u64, stores: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        self.store.read(offset, stores)
    }

    pub fn num_segments(&self) -> Result<usize> {
        self.store.num_segments()
    }

    pub fn end_offset(&self) -> Result<u64> {
        self.store.meta().end_offset()
    }

    pub fn segment_metas(&self) -> Result<Vec<FileMeta>> {
        self.store.meta().files()
    }
}

impl Store {
    pub(crate) fn read(&self, offset: u64, stores: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let end = self.meta().end_offset()?;
        if offset > end {
            return Err(Error::OffsetOutOfRange { offset, end });
        }

        let want = stores.len().max(1);
        let mut stores = stores.into_iter();
        let mut records = Vec::with_capacity(want);
        let mut offset = offset;

        while records.len() < want {
            let Some((index, file)) = self.meta().locate(offset)? else {
                break;
            };
            let segment = self.segment(index)?;
            let local = offset - file.start_offset;
            if local + LEN_PREFIX as u64 > file.end_offset {
                return Err(Error::Corrupt("length prefix crosses committed end"));
            }
            let len = decode_len(segment.read_at(local, LEN_PREFIX)?)?;
            let payload_at = local + LEN_PREFIX as u64;
            if payload_at + len as u64 > file.end_offset {
                return Err(Error::Corrupt("record length exceeds committed range"));
            }

            let mut record = stores.next().unwrap_or_default();
            record.clear();
            record.extend_from_slice(segment.read_at(payload_at, len)?);
            records.push(record);
            offset = file.start_offset + payload_at + len as u64;
        }
        Ok(records)
    }
}
