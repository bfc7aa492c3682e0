//! Heap and anonymous-map tiers.

use std::ptr::NonNull;

use memmap2::MmapMut;

use super::{read_addressable, write_addressable, Tier, TierKind};
use crate::error::{CacheError, Result};
use crate::morphology::{Quantum, QUANTUM_SIZE};

/// Pixels in a zeroed heap allocation.
#[derive(Debug)]
pub(crate) struct HeapTier {
    base: NonNull<Quantum>,
    samples: usize,
    len: u64,
}

// SAFETY: the allocation is owned exclusively by the tier; concurrent access goes
// through raw copies on disjoint ranges.
unsafe impl Send for HeapTier {}
unsafe impl Sync for HeapTier {}

impl HeapTier {
    /// Allocate `len` bytes, or `None` if the allocator refuses.
    pub(crate) fn allocate(len: u64) -> Option<Self> {
        let samples = usize::try_from(len.div_ceil(QUANTUM_SIZE as u64)).ok()?;
        let mut buffer: Vec<Quantum> = Vec::new();
        buffer.try_reserve_exact(samples).ok()?;
        buffer.resize(samples, 0);
        let boxed = buffer.into_boxed_slice();
        let base = NonNull::new(Box::into_raw(boxed) as *mut Quantum)?;
        Some(Self {
            base,
            samples,
            len,
        })
    }

    fn bytes(&self) -> NonNull<u8> {
        self.base.cast()
    }
}

impl Drop for HeapTier {
    fn drop(&mut self) {
        // SAFETY: base and samples come from the boxed slice leaked in `allocate`.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.samples);
            drop(Box::from_raw(slice));
        }
    }
}

impl Tier for HeapTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn label(&self) -> &'static str {
        "Heap Memory"
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn base(&self) -> Option<NonNull<u8>> {
        Some(self.bytes())
    }

    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // SAFETY: the allocation spans at least `len` bytes.
        unsafe { read_addressable(self.bytes(), self.len, offset, buf) }
    }

    fn write_range(&self, offset: u64, buf: &[u8]) -> Result<()> {
        // SAFETY: as above.
        unsafe { write_addressable(self.bytes(), self.len, offset, buf) }
    }
}

/// Pixels in an anonymous private mapping.
#[derive(Debug)]
pub(crate) struct AnonMapTier {
    _map: MmapMut,
    base: NonNull<u8>,
    len: u64,
}

// SAFETY: the mapping is owned by the tier and only accessed through raw copies
// on disjoint ranges.
unsafe impl Send for AnonMapTier {}
unsafe impl Sync for AnonMapTier {}

impl AnonMapTier {
    pub(crate) fn map(len: u64) -> Result<Self> {
        let size = usize::try_from(len)
            .map_err(|_| CacheError::AllocationFailed(format!("{} bytes", len)))?;
        let mut map = MmapMut::map_anon(size).map_err(|err| {
            CacheError::AllocationFailed(format!("anonymous map of {} bytes: {}", len, err))
        })?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| CacheError::AllocationFailed("null anonymous map".to_string()))?;
        Ok(Self {
            _map: map,
            base,
            len,
        })
    }
}

impl Tier for AnonMapTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn label(&self) -> &'static str {
        "Anonymous Memory"
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
}
