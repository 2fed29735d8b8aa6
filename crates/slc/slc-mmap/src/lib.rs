//! Thin file-to-memory mapping primitive.
//!
//! Owns a `File` and a `memmap2` mapping over it and exposes raw byte access.
//! Carries no knowledge of what the bytes mean; the format and coherence
//! protocol built on top live in `slc-core`.

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

pub struct MmapFileMut {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    /// Memory-mapped region providing mutable access to file contents
    mmap: MmapMut,
}

pub struct MmapFile {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    /// Memory-mapped region providing read-only access to file contents
    mmap: Mmap,
}

impl MmapFileMut {
    /// Create a new file sized to `size_bytes` and map it read-write.
    pub fn create_rw<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size_bytes)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Open an existing file and map it read-write at its current length.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Open an existing file handle directly, skipping the path lookup.
    ///
    /// Used when the caller already holds the `File` (e.g. after acquiring
    /// a cross-process lock against the same descriptor).
    pub fn from_file(file: File) -> io::Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Flush the whole mapping to the backing file (`msync`).
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Flush a byte sub-range of the mapping to the backing file.
    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.mmap.flush_range(offset, len)
    }

    /// `fsync` the backing file descriptor directly (distinct from `msync`
    /// on the mapping: used once at creation time to durably persist the
    /// freshly allocated length and header before any reader can see it).
    pub fn sync_file(&self) -> io::Result<()> {
        self._file.sync_all()
    }
}

impl MmapFile {
    /// Open an existing file and map it read-only.
    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_path(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/tmp/slc_mmap_test_{tag}_{ts}")
    }

    #[test]
    fn mmap_roundtrip_bytes() {
        let path = scratch_path("roundtrip");
        let size = 4096;

        {
            let mut mm = MmapFileMut::create_rw(&path, size).unwrap();
            mm.as_mut_slice()[0] = 0xAB;
            mm.as_mut_slice()[1] = 0xCD;
        }
        {
            let mm = MmapFile::open_ro(&path).unwrap();
            assert_eq!(mm.as_slice()[0], 0xAB);
            assert_eq!(mm.as_slice()[1], 0xCD);
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn grows_file_to_requested_size() {
        let path = scratch_path("grow");
        let mm = MmapFileMut::create_rw(&path, 8192).unwrap();
        assert_eq!(mm.len(), 8192);
        let _ = fs::remove_file(&path);
    }
}
