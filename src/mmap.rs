use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapOptions, MmapRaw};

use crate::{Error, Result};

/// A file mapped read/write into memory.
///
/// Writes go through a shared reference so that one thread can append into a
/// region while others read regions that were already published. Callers
/// must keep those regions disjoint. A zero-length file has no mapping.
pub struct MmapFile {
    file: File,
    map: Option<MmapRaw>,
    len: usize,
    writable: bool,
}

impl MmapFile {
    /// Create (or truncate) `path` as a sparse file of `len` bytes and map it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(Self {
            file,
            map: Some(map),
            len,
            writable: true,
        })
    }

    /// Map an existing file at its current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file_len(&file)?;
        let map = if len == 0 {
            None
        } else {
            Some(MmapOptions::new().len(len).map_raw(&file)?)
        };
        Ok(Self {
            file,
            map,
            len,
            writable: true,
        })
    }

    /// Map an existing file without write access. Writes, truncation and
    /// flushes fail with [`Error::ReadOnly`].
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file_len(&file)?;
        let map = if len == 0 {
            None
        } else {
            Some(MmapOptions::new().len(len).map_raw_read_only(&file)?)
        };
        Ok(Self {
            file,
            map,
            len,
            writable: false,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        let map = self.map.as_ref().ok_or(Error::Corrupt("range out of bounds"))?;
        // SAFETY: the range is inside the mapping, and the single writer never
        // touches bytes a reader was handed (see type docs).
        Ok(unsafe { std::slice::from_raw_parts(map.as_ptr().add(offset), len) })
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let map = self.map.as_ref().ok_or(Error::Corrupt("range out of bounds"))?;
        // SAFETY: bounds checked above; only the owning writer calls this, on
        // bytes that no reader has been allowed to see yet.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Resize the file to `len` bytes and remap it.
    pub fn truncate(&mut self, len: usize) -> Result<()> {
        self.check_writable()?;
        if let Some(map) = self.map.take() {
            map.flush()?;
        }
        self.file.set_len(len as u64)?;
        self.len = len;
        if len > 0 {
            self.map = Some(MmapOptions::new().len(len).map_raw(&self.file)?);
        }
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.check_writable()?;
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.check_writable()?;
        if let Some(map) = &self.map {
            map.flush_async()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.check_writable()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(())
    }
}

fn file_len(file: &File) -> Result<usize> {
    usize::try_from(file.metadata()?.len())
        .map_err(|_| Error::Corrupt("file exceeds addressable range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.bin");
        let mmap = MmapFile::create(&path, 4096)?;
        mmap.write_at(10, b"abc")?;
        mmap.flush_sync()?;
        drop(mmap);

        let mmap = MmapFile::open(&path)?;
        assert_eq!(mmap.len(), 4096);
        assert_eq!(mmap.range(10, 3)?, b"abc");
        Ok(())
    }

    #[test]
    fn out_of_bounds_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mmap = MmapFile::create(&dir.path().join("data.bin"), 16)?;
        assert!(matches!(mmap.write_at(14, b"abc"), Err(Error::Corrupt(_))));
        assert!(matches!(mmap.range(usize::MAX, 2), Err(Error::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn truncate_to_zero_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.bin");
        let mut mmap = MmapFile::create(&path, 64)?;
        mmap.truncate(0)?;
        assert!(mmap.is_empty());
        assert_eq!(mmap.range(0, 0)?, b"");
        drop(mmap);

        let mmap = MmapFile::open(&path)?;
        assert_eq!(mmap.len(), 0);
        Ok(())
    }

    #[test]
    fn read_only_mapping_rejects_writes() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.bin");
        let mmap = MmapFile::create(&path, 32)?;
        mmap.write_at(0, b"seen")?;
        mmap.flush_sync()?;
        drop(mmap);

        let mut mmap = MmapFile::open_read_only(&path)?;
        assert_eq!(mmap.range(0, 4)?, b"seen");
        assert!(matches!(mmap.write_at(0, b"x"), Err(Error::ReadOnly)));
        assert!(matches!(mmap.truncate(4), Err(Error::ReadOnly)));
        assert!(matches!(mmap.flush_async(), Err(Error::ReadOnly)));
        assert_eq!(std::fs::metadata(&path)?.len(), 32);
        Ok(())
    }
}
