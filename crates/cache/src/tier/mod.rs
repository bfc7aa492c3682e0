//! Storage tiers backing a pixel array.
//!
//! Every tier exposes the same byte-range interface so region binding and
//! cloning never need to know where the bytes live. Memory-addressable tiers
//! additionally expose a base pointer for zero-copy views.

mod disk;
mod mapped;
mod memory;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::Result;

pub(crate) use disk::{DiskHandle, DiskTier};
pub(crate) use mapped::FileMapTier;
pub(crate) use memory::{AnonMapTier, HeapTier};

/// Where a cache's pixels live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TierKind {
    /// Not opened yet; no pixel access is valid.
    #[default]
    Undefined,
    /// Heap allocation or anonymous map.
    Memory,
    /// Memory-mapped cache file.
    MemoryMapped,
    /// Cache file accessed with positional I/O.
    Disk,
    /// Dimensions only; pixels intentionally absent.
    Ping,
}

impl TierKind {
    /// Tiers whose bytes can be addressed directly.
    pub fn is_addressable(&self) -> bool {
        matches!(self, TierKind::Memory | TierKind::MemoryMapped)
    }

    /// Tiers that hold pixel bytes.
    pub fn has_pixels(&self) -> bool {
        matches!(
            self,
            TierKind::Memory | TierKind::MemoryMapped | TierKind::Disk
        )
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TierKind::Undefined => "Undefined",
            TierKind::Memory => "Memory",
            TierKind::MemoryMapped => "MemoryMapped",
            TierKind::Disk => "Disk",
            TierKind::Ping => "Ping",
        };
        f.write_str(name)
    }
}

/// Byte-range access to one tier.
///
/// Writes take `&self`: concurrent callers must touch disjoint ranges, the
/// same contract nexus views rely on.
pub(crate) trait Tier: Send + Sync + fmt::Debug {
    fn kind(&self) -> TierKind;

    /// Human readable backing description, e.g. "Heap Memory".
    fn label(&self) -> &'static str;

    /// Byte length of the pixel array.
    fn len(&self) -> u64;

    /// Start of the pixel array for addressable tiers.
    fn base(&self) -> Option<NonNull<u8>> {
        None
    }

    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_range(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Make writes durable in the backing file.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Stop deleting the backing file when the tier is dropped.
    fn keep_file(&mut self) {}
}

/// Copy between an addressable tier and a caller buffer.
///
/// # Safety
///
/// `base` must point to at least `len` valid bytes, and no other thread may
/// access `[offset, offset + buf.len())` concurrently.
pub(crate) unsafe fn read_addressable(
    base: NonNull<u8>,
    len: u64,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    check_range(len, offset, buf.len())?;
    std::ptr::copy_nonoverlapping(
        base.as_ptr().add(offset as usize),
        buf.as_mut_ptr(),
        buf.len(),
    );
    Ok(())
}

/// # Safety
///
/// Same contract as [`read_addressable`].
pub(crate) unsafe fn write_addressable(
    base: NonNull<u8>,
    len: u64,
    offset: u64,
    buf: &[u8],
) -> Result<()> {
    check_range(len, offset, buf.len())?;
    std::ptr::copy_nonoverlapping(
        buf.as_ptr(),
        base.as_ptr().add(offset as usize),
        buf.len(),
    );
    Ok(())
}

fn check_range(len: u64, offset: u64, count: usize) -> Result<()> {
    match offset.checked_add(count as u64) {
        Some(end) if end <= len => Ok(()),
        _ => Err(crate::CacheError::AllocationFailed(format!(
            "range {}+{} exceeds tier length {}",
            offset, count, len
        ))),
    }
}

/// Deletes a private cache file when dropped.
#[derive(Debug, Default)]
pub(crate) struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    pub(crate) fn owned(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub(crate) fn none() -> Self {
        Self { path: None }
    }

    pub(crate) fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("removed cache file {}", path.display()),
                Err(err) => log::warn!("failed to remove cache file {}: {}", path.display(), err),
            }
        }
    }
}
