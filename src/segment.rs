//! Segment files.
//!
//! A segment is one memory-mapped, append-only file holding a contiguous
//! range of the framed record stream. Segments live in `<dir>/segments/` and
//! are named by index (`000000007.q`). Only the last segment takes writes;
//! once a newer one exists it is sealed and may be shrunk to its final size.

use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::meta::FileMeta;
use crate::mmap::MmapFile;
use crate::{Error, Result};

/// Size of the big-endian length prefix in front of every record.
pub const LEN_PREFIX: usize = 4;

/// Subdirectory of the queue root holding the segment files.
pub const SEGMENT_DIR: &str = "segments";

pub fn segment_filename(index: u32) -> String {
    format!("{:09}.q", index)
}

pub fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(segment_filename(index))
}

pub fn encode_len(len: usize) -> [u8; LEN_PREFIX] {
    (len as u32).to_be_bytes()
}

pub fn decode_len(bytes: &[u8]) -> Result<usize> {
    let prefix: [u8; LEN_PREFIX] = bytes
        .get(..LEN_PREFIX)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Corrupt("truncated length prefix"))?;
    Ok(u32::from_be_bytes(prefix) as usize)
}

pub struct Segment {
    index: u32,
    start_offset: u64,
    /// Bytes written into this segment.
    position: AtomicU64,
    mmap: MmapFile,
}

impl Segment {
    /// Allocate a new, empty segment of `capacity` bytes.
    pub fn create(dir: &Path, index: u32, start_offset: u64, capacity: usize) -> Result<Self> {
        let mmap = MmapFile::create(&segment_path(dir, index), capacity)?;
        Ok(Self {
            index,
            start_offset,
            position: AtomicU64::new(0),
            mmap,
        })
    }

    /// Reopen an existing segment and restore its write position from `meta`.
    pub fn open(dir: &Path, index: u32, meta: &FileMeta) -> Result<Self> {
        Self::from_mmap(MmapFile::open(&segment_path(dir, index))?, index, meta)
    }

    /// Map an existing segment for reading only. It cannot be written,
    /// shrunk or flushed.
    pub fn open_read_only(dir: &Path, index: u32, meta: &FileMeta) -> Result<Self> {
        Self::from_mmap(
            MmapFile::open_read_only(&segment_path(dir, index))?,
            index,
            meta,
        )
    }

    fn from_mmap(mmap: MmapFile, index: u32, meta: &FileMeta) -> Result<Self> {
        if meta.end_offset > mmap.len() as u64 {
            return Err(Error::Corrupt("segment shorter than recorded end offset"));
        }
        Ok(Self {
            index,
            start_offset: meta.start_offset,
            position: AtomicU64::new(meta.end_offset),
            mmap,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Global offset of this segment's first byte.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    /// Bytes written so far within this segment.
    pub fn wrote_position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Global offset one past the last written byte.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.wrote_position()
    }

    /// Append all of `bufs` or nothing.
    ///
    /// Returns the local position where the first buffer landed. If the total
    /// does not fit in the remaining capacity, fails with
    /// [`Error::WriteBeyond`] and leaves the segment untouched.
    ///
    /// Must only be called by the segment's single writer.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<u64> {
        let start = self.position.load(Ordering::Relaxed);
        let total: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        let end = start.checked_add(total).ok_or(Error::WriteBeyond)?;
        if end > self.mmap.len() as u64 {
            return Err(Error::WriteBeyond);
        }
        let mut offset = start as usize;
        for buf in bufs {
            self.mmap.write_at(offset, buf)?;
            offset += buf.len();
        }
        self.position.store(end, Ordering::Release);
        Ok(start)
    }

    /// Bytes at `local..local + len`. Must lie below the write position.
    pub fn read_at(&self, local: u64, len: usize) -> Result<&[u8]> {
        let end = local
            .checked_add(len as u64)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.wrote_position() {
            return Err(Error::Corrupt("read past segment write position"));
        }
        self.mmap.range(local as usize, len)
    }

    /// Trim the backing file down to the bytes actually written.
    ///
    /// Only valid on a sealed segment.
    pub fn shrink(&mut self) -> Result<()> {
        let position = self.wrote_position() as usize;
        if position == self.mmap.len() {
            return Ok(());
        }
        self.mmap.truncate(position)?;
        self.mmap.sync()?;
        log::debug!(
            "shrunk segment {} to {} bytes",
            segment_filename(self.index),
            position
        );
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush_sync()
    }

    pub fn flush_async(&self) -> Result<()> {
        self.mmap.flush_async()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = encode_len(payload.len()).to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn filename_is_zero_padded() {
        assert_eq!(segment_filename(0), "000000000.q");
        assert_eq!(segment_filename(42), "000000042.q");
    }

    #[test]
    fn vectored_write_advances_position() -> Result<()> {
        let dir = tempdir()?;
        let segment = Segment::create(dir.path(), 0, 100, 64)?;
        let prefix = encode_len(5);
        let first = segment.write_vectored(&[IoSlice::new(&prefix), IoSlice::new(b"hello")])?;
        assert_eq!(first, 0);
        let second = segment.write_vectored(&[IoSlice::new(&prefix), IoSlice::new(b"world")])?;
        assert_eq!(second, 9);
        assert_eq!(segment.wrote_position(), 18);
        assert_eq!(segment.end_offset(), 118);
        assert_eq!(segment.read_at(9, 9)?, frame(b"world").as_slice());
        Ok(())
    }

    #[test]
    fn overflow_writes_nothing() -> Result<()> {
        let dir = tempdir()?;
        let segment = Segment::create(dir.path(), 0, 0, 16)?;
        segment.write_vectored(&[IoSlice::new(&[1u8; 10])])?;
        let err = segment
            .write_vectored(&[IoSlice::new(&[2u8; 4]), IoSlice::new(&[3u8; 4])])
            .expect_err("overflow");
        assert!(matches!(err, Error::WriteBeyond));
        assert_eq!(segment.wrote_position(), 10);
        assert!(segment.read_at(10, 1).is_err());
        Ok(())
    }

    #[test]
    fn reopen_restores_position_and_shrinks() -> Result<()> {
        let dir = tempdir()?;
        let segment = Segment::create(dir.path(), 3, 500, 1024)?;
        segment.write_vectored(&[IoSlice::new(&frame(b"payload"))])?;
        segment.flush()?;
        let meta = FileMeta {
            start_offset: 500,
            msg_count: 1,
            end_offset: segment.wrote_position(),
            last_write_ns: 0,
        };
        drop(segment);

        let mut reopened = Segment::open(dir.path(), 3, &meta)?;
        assert_eq!(reopened.capacity(), 1024);
        assert_eq!(reopened.end_offset(), 511);
        reopened.shrink()?;
        assert_eq!(reopened.capacity(), 11);
        let len = std::fs::metadata(segment_path(dir.path(), 3))?.len();
        assert_eq!(len, 11);
        assert_eq!(reopened.read_at(4, 7)?, b"payload");
        Ok(())
    }

    #[test]
    fn open_rejects_end_past_file() -> Result<()> {
        let dir = tempdir()?;
        drop(Segment::create(dir.path(), 0, 0, 64)?);
        let meta = FileMeta {
            start_offset: 0,
            msg_count: 0,
            end_offset: 65,
            last_write_ns: 0,
        };
        assert!(matches!(
            Segment::open(dir.path(), 0, &meta),
            Err(Error::Corrupt(_))
        ));
        Ok(())
    }

    #[test]
    fn decode_len_needs_four_bytes() {
        assert_eq!(decode_len(&[0, 0, 1, 2]).expect("len"), 258);
        assert!(decode_len(&[0, 1]).is_err());
    }

    #[test]
    fn read_only_segment_is_left_untouched() -> Result<()> {
        let dir = tempdir()?;
        let segment = Segment::create(dir.path(), 0, 0, 64)?;
        segment.write_vectored(&[IoSlice::new(&frame(b"ro"))])?;
        segment.flush()?;
        let meta = FileMeta {
            start_offset: 0,
            msg_count: 1,
            end_offset: segment.wrote_position(),
            last_write_ns: 0,
        };
        drop(segment);

        let mut segment = Segment::open_read_only(dir.path(), 0, &meta)?;
        assert_eq!(segment.read_at(4, 2)?, b"ro");
        assert!(matches!(
            segment.write_vectored(&[IoSlice::new(b"x")]),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(segment.shrink(), Err(Error::ReadOnly)));
        assert_eq!(segment.wrote_position(), 6);
        assert_eq!(std::fs::metadata(segment_path(dir.path(), 0))?.len(), 64);
        Ok(())
    }
}
