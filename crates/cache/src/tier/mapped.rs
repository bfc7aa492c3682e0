//! Memory-mapped cache files.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};

use super::{read_addressable, write_addressable, TempFileGuard, Tier, TierKind};
use crate::error::{CacheError, Result};
use crate::morphology::CacheMode;

#[derive(Debug)]
pub(crate) struct FileMapTier {
    // Field order matters: the map must be gone before the file is removed.
    map: MmapMut,
    base: NonNull<u8>,
    len: u64,
    temp: TempFileGuard,
    path: PathBuf,
}

// SAFETY: the mapping is owned by the tier and only accessed through raw copies
// on disjoint ranges.
unsafe impl Send for FileMapTier {}
unsafe impl Sync for FileMapTier {}

impl FileMapTier {
    /// Map `len` bytes of `file` starting at the page-aligned `offset`.
    ///
    /// Read-only caches get a private copy-on-write mapping so stray writes
    /// never reach the file.
    pub(crate) fn map(
        file: &File,
        path: &Path,
        offset: u64,
        len: u64,
        mode: CacheMode,
    ) -> Result<Self> {
        let size = usize::try_from(len)
            .map_err(|_| CacheError::AllocationFailed(format!("{} bytes", len)))?;
        let mut options = MmapOptions::new();
        options.offset(offset).len(size);
        // SAFETY: the cache file is private to this process or attached read-only;
        // nothing truncates it while mapped.
        let mapped = unsafe {
            if mode.is_writable() {
                options.map_mut(file)
            } else {
                options.map_copy(file)
            }
        };
        let mut map = mapped.map_err(|err| CacheError::io(path, err))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| CacheError::AllocationFailed("null file map".to_string()))?;
        Ok(Self {
            map,
            base,
            len,
            temp: TempFileGuard::none(),
            path: path.to_path_buf(),
        })
    }

    /// Delete the file when the tier is dropped.
    pub(crate) fn with_temp(mut self, temp: TempFileGuard) -> Self {
        self.temp = temp;
        self
    }
}

impl Tier for FileMapTier {
    fn kind(&self) -> TierKind {
        TierKind::MemoryMapped
    }

    fn label(&self) -> &'static str {
        "Memory-mapped"
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn base(&self) -> Option<NonNull<u8>> {
        Some(self.base)
    }

    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // SAFETY: the mapping spans `len` bytes and lives as long as `self`.
        unsafe { read_addressable(self.base, self.len, offset, buf) }
    }

    fn write_range(&self, offset: u64, buf: &[u8]) -> Result<()> {
        // SAFETY: as above.
        unsafe { write_addressable(self.base, self.len, offset, buf) }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|err| CacheError::io(&self.path, err))
    }

    fn keep_file(&mut self) {
        self.temp.disarm();
    }
}
