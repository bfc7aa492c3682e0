//! Per-worker views onto a rectangular region of a store.
//!
//! A nexus either points straight into the store's pixel array (when the tier
//! is addressable and the region is one contiguous run) or stages the region
//! in a private scratch buffer that [`Nexus::sync`] writes back.

use std::slice;

use parking_lot::MutexGuard;
use rand::Rng;

use crate::error::{CacheError, Result};
use crate::geometry::Region;
use crate::morphology::{PixelMorphology, Quantum, QUANTUM_SIZE};
use crate::store::CacheStore;
use crate::tier::Tier;
use crate::virtual_pixel::{constant_pixel, resolve, Source, VirtualPixelMethod};

/// Where the bound region's samples live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PixelsView {
    #[default]
    Unbound,
    /// In the store's buffer, as sample and metacontent byte offsets.
    Borrowed {
        sample: usize,
        samples: usize,
        meta: usize,
        meta_len: usize,
    },
    /// In the nexus scratch buffers.
    Owned,
}

/// The part of the image a bound nexus may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub(crate) footprint: Region,
    pub(crate) writable: bool,
}

impl Claim {
    /// Two binds conflict when they overlap and either may write.
    pub(crate) fn conflicts(&self, other: &Claim) -> bool {
        (self.writable || other.writable) && self.footprint.intersects(&other.footprint)
    }
}

/// State of one nexus slot, kept across binds so scratch buffers are reused.
#[derive(Debug, Default)]
pub(crate) struct NexusView {
    region: Region,
    pixels: PixelsView,
    authentic: bool,
    scratch: Vec<Quantum>,
    meta_scratch: Vec<u8>,
}

impl NexusView {
    pub(crate) fn reset(&mut self) {
        self.pixels = PixelsView::Unbound;
        self.authentic = false;
    }

    fn ensure_scratch(&mut self, samples: usize, meta: usize) -> Result<()> {
        if self.scratch.len() != samples {
            self.scratch = zeroed(samples)?;
        }
        if self.meta_scratch.len() != meta {
            self.meta_scratch = zeroed(meta)?;
        }
        Ok(())
    }
}

fn zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|err| CacheError::AllocationFailed(format!("nexus scratch of {} elements: {}", len, err)))?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// One run of pixels that is contiguous in the tier.
struct Span {
    x: u64,
    y: u64,
    /// Index of the run's first pixel within the region.
    first: usize,
    pixels: usize,
}

fn spans(morphology: &PixelMorphology, region: Region) -> impl Iterator<Item = Span> {
    let whole_rows = region.x == 0 && region.width == morphology.columns;
    let (count, width) = if whole_rows {
        (1, region.width * region.height)
    } else {
        (region.height, region.width)
    };
    let (x, y) = (region.x as u64, region.y as u64);
    (0..count).map(move |row| Span {
        x,
        y: y + row,
        first: (row * width) as usize,
        pixels: width as usize,
    })
}

fn read_pixels(
    tier: &dyn Tier,
    morphology: &PixelMorphology,
    x: u64,
    y: u64,
    samples: &mut [Quantum],
    meta: &mut [u8],
) -> Result<()> {
    tier.read_range(morphology.pixel_offset(x, y), bytemuck::cast_slice_mut(samples))?;
    if !meta.is_empty() {
        tier.read_range(morphology.metacontent_offset(x, y), meta)?;
    }
    Ok(())
}

/// A worker's handle on one nexus slot of a store.
///
/// Obtained from [`CacheStore::nexus`]. Each bind replaces the previous one;
/// slices returned by earlier calls cannot outlive it.
///
/// # Concurrency
///
/// Workers holding different slots may run in parallel. A bind that overlaps a
/// region another slot has bound fails with [`CacheError::RegionInUse`] when
/// either bind is authentic, so two writable views never alias. Virtual binds
/// reaching outside the image count as covering all of it. A slot's claim is
/// released when its `Nexus` is dropped.
///
/// # Example
///
/// ```
/// use pixel_cache::{CacheMode, CacheStore, PixelMorphology, Region};
///
/// let mut store = CacheStore::acquire(1);
/// store.open(PixelMorphology::new(4, 4, 1), CacheMode::ReadWrite).unwrap();
///
/// let mut nexus = store.nexus(0).unwrap();
/// let row = nexus.get_authentic(Region::row(0, 2, 4)).unwrap();
/// row.copy_from_slice(&[1, 2, 3, 4]);
/// nexus.sync().unwrap();
/// ```
pub struct Nexus<'a> {
    store: &'a CacheStore,
    view: MutexGuard<'a, NexusView>,
    index: usize,
}

impl<'a> Nexus<'a> {
    pub(crate) fn new(store: &'a CacheStore, view: MutexGuard<'a, NexusView>, index: usize) -> Self {
        Self { store, view, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn store(&self) -> &'a CacheStore {
        self.store
    }

    /// Region of the most recent bind.
    pub fn region(&self) -> Region {
        self.view.region
    }

    /// Whether the bound region is viewed in place rather than staged.
    pub fn is_direct(&self) -> bool {
        matches!(self.view.pixels, PixelsView::Borrowed { .. })
    }

    /// Bind an in-bounds region for reading and writing.
    ///
    /// Changes are durable after [`sync`](Self::sync).
    pub fn get_authentic(&mut self, region: Region) -> Result<&mut [Quantum]> {
        let store = self.store;
        let tier = store.pixel_tier()?;
        self.bind(region, true)?;
        if self.view.pixels == PixelsView::Owned {
            self.load(tier)?;
        }
        Ok(self.pixels_mut())
    }

    /// Bind an in-bounds region for writing only. The returned samples are
    /// unspecified until the caller fills them.
    pub fn queue_authentic(&mut self, region: Region) -> Result<&mut [Quantum]> {
        if !self.store.mode().is_writable() {
            return Err(CacheError::ReadOnlyCache);
        }
        self.bind(region, true)?;
        Ok(self.pixels_mut())
    }

    /// Bind any region for reading, resolving pixels outside the image with `method`.
    pub fn get_virtual(&mut self, method: VirtualPixelMethod, region: Region) -> Result<&[Quantum]> {
        let store = self.store;
        let tier = store.pixel_tier()?;
        self.bind(region, false)?;
        if self.view.pixels == PixelsView::Owned {
            let morphology = store.morphology();
            if region.is_within(morphology.columns, morphology.rows) {
                self.load(tier)?;
            } else {
                self.load_virtual(tier, method)?;
            }
        }
        Ok(self.pixels())
    }

    /// [`get_virtual`](Self::get_virtual) with the store's own method.
    pub fn get_virtual_pixels(&mut self, region: Region) -> Result<&[Quantum]> {
        let method = self.store.virtual_pixel_method();
        self.get_virtual(method, region)
    }

    /// Samples of the bound region.
    pub fn pixels(&self) -> &[Quantum] {
        match self.view.pixels {
            PixelsView::Borrowed { sample, samples, .. } => match self.base() {
                // SAFETY: the offsets were validated against the tier at bind time
                // and the tier cannot change while the store is borrowed.
                Some(base) => unsafe { slice::from_raw_parts(base.add(sample), samples) },
                None => &[],
            },
            PixelsView::Owned => self.view.scratch.as_slice(),
            PixelsView::Unbound => &[],
        }
    }

    /// Writable samples of an authentic bind; empty otherwise.
    pub fn pixels_mut(&mut self) -> &mut [Quantum] {
        if !self.view.authentic {
            return &mut [];
        }
        match self.view.pixels {
            PixelsView::Borrowed { sample, samples, .. } => match self.base() {
                // SAFETY: as in `pixels`; the store's claims keep any other slot
                // from binding an overlapping region while this one is bound.
                Some(base) => unsafe { slice::from_raw_parts_mut(base.add(sample), samples) },
                None => &mut [],
            },
            PixelsView::Owned => self.view.scratch.as_mut_slice(),
            PixelsView::Unbound => &mut [],
        }
    }

    /// Metacontent of the bound region, if the layout has any.
    pub fn metacontent(&self) -> Option<&[u8]> {
        if self.store.morphology().metacontent_extent == 0 {
            return None;
        }
        match self.view.pixels {
            PixelsView::Borrowed { meta, meta_len, .. } => {
                let base = self.store.pixel_tier().ok()?.base()?;
                // SAFETY: as in `pixels`.
                Some(unsafe { slice::from_raw_parts(base.as_ptr().add(meta), meta_len) })
            }
            PixelsView::Owned => Some(self.view.meta_scratch.as_slice()),
            PixelsView::Unbound => None,
        }
    }

    /// Writable metacontent of an authentic bind.
    pub fn metacontent_mut(&mut self) -> Option<&mut [u8]> {
        if self.store.morphology().metacontent_extent == 0 || !self.view.authentic {
            return None;
        }
        match self.view.pixels {
            PixelsView::Borrowed { meta, meta_len, .. } => {
                let base = self.store.pixel_tier().ok()?.base()?;
                // SAFETY: as in `pixels_mut`.
                Some(unsafe { slice::from_raw_parts_mut(base.as_ptr().add(meta), meta_len) })
            }
            PixelsView::Owned => Some(self.view.meta_scratch.as_mut_slice()),
            PixelsView::Unbound => None,
        }
    }

    /// Write a staged authentic region back to the store.
    ///
    /// In-place views need no write-back. With a mask active, each pixel is
    /// blended with the value it replaces. Read-only stores refuse every sync.
    pub fn sync(&mut self) -> Result<()> {
        if !self.view.authentic {
            return Ok(());
        }
        if !self.store.mode().is_writable() {
            return Err(CacheError::ReadOnlyCache);
        }
        if self.view.pixels != PixelsView::Owned {
            return Ok(());
        }
        let store = self.store;
        let tier = store.pixel_tier()?;
        let morphology = store.morphology();
        let channels = morphology.channels as usize;
        let extent = morphology.metacontent_extent as usize;
        let view = &mut *self.view;

        let mut previous = Vec::new();
        for span in spans(morphology, view.region) {
            let offset = morphology.pixel_offset(span.x, span.y);
            let samples = &mut view.scratch[span.first * channels..][..span.pixels * channels];
            if let Some(mask) = store.mask() {
                previous.clear();
                previous.resize(samples.len(), 0 as Quantum);
                tier.read_range(offset, bytemuck::cast_slice_mut(&mut previous))?;
                let linear = span.y * morphology.columns + span.x;
                for (i, (new, old)) in samples
                    .chunks_mut(channels)
                    .zip(previous.chunks(channels))
                    .enumerate()
                {
                    let pixel = linear + i as u64;
                    mask.blend(pixel % morphology.columns, pixel / morphology.columns, new, old);
                }
            }
            tier.write_range(offset, bytemuck::cast_slice(samples))?;
            if extent > 0 {
                let meta = &view.meta_scratch[span.first * extent..][..span.pixels * extent];
                tier.write_range(morphology.metacontent_offset(span.x, span.y), meta)?;
            }
        }
        Ok(())
    }

    fn base(&self) -> Option<*mut Quantum> {
        let base = self.store.pixel_tier().ok()?.base()?;
        Some(base.as_ptr().cast::<Quantum>())
    }

    fn bind(&mut self, region: Region, authentic: bool) -> Result<()> {
        let store = self.store;
        let tier = store.pixel_tier()?;
        let morphology = store.morphology();
        if region.is_empty() {
            return Err(CacheError::EmptyRegion(region));
        }
        let inside = region.is_within(morphology.columns, morphology.rows);
        if authentic && !inside {
            return Err(CacheError::PixelsAreNotAuthentic(region));
        }
        let samples = morphology.samples_for(&region)?;
        let meta_len = morphology.metacontent_for(&region)?;

        let footprint = if inside {
            region
        } else {
            Region::new(0, 0, morphology.columns, morphology.rows)
        };
        let claim = Claim {
            footprint,
            writable: authentic,
        };
        if let Err(err) = store.claim(self.index, claim, region) {
            self.view.reset();
            return Err(err);
        }

        let view = &mut *self.view;
        view.region = region;
        view.authentic = authentic;

        let contiguous = region.height == 1 || (region.x == 0 && region.width == morphology.columns);
        if inside && contiguous && tier.base().is_some() && store.mask().is_none() {
            let (x, y) = (region.x as u64, region.y as u64);
            view.pixels = PixelsView::Borrowed {
                sample: (morphology.pixel_offset(x, y) / QUANTUM_SIZE as u64) as usize,
                samples,
                meta: morphology.metacontent_offset(x, y) as usize,
                meta_len,
            };
            log::trace!("{} nexus {} bound {} in place", store.id(), self.index, region);
            return Ok(());
        }

        view.ensure_scratch(samples, meta_len)?;
        view.pixels = PixelsView::Owned;
        log::trace!("{} nexus {} staged {}", store.id(), self.index, region);
        Ok(())
    }

    /// Fill the scratch buffers from an in-bounds region.
    fn load(&mut self, tier: &dyn Tier) -> Result<()> {
        let store = self.store;
        let morphology = store.morphology();
        let channels = morphology.channels as usize;
        let extent = morphology.metacontent_extent as usize;
        let view = &mut *self.view;
        for span in spans(morphology, view.region) {
            read_pixels(
                tier,
                morphology,
                span.x,
                span.y,
                &mut view.scratch[span.first * channels..][..span.pixels * channels],
                &mut view.meta_scratch[span.first * extent..][..span.pixels * extent],
            )?;
        }
        Ok(())
    }

    /// Fill the scratch buffers from a region that reaches outside the image.
    ///
    /// In-bounds runs are copied in bulk; every other pixel is resolved by `method`.
    fn load_virtual(&mut self, tier: &dyn Tier, method: VirtualPixelMethod) -> Result<()> {
        let store = self.store;
        let morphology = store.morphology();
        let (columns, rows) = (morphology.columns, morphology.rows);
        let channels = morphology.channels as usize;
        let extent = morphology.metacontent_extent as usize;
        let constant = constant_pixel(method, morphology, store.background());
        let view = &mut *self.view;
        let region = view.region;

        let mut rng = None;
        let mut uniform = || rng.get_or_insert_with(|| store.random.lock()).gen::<f64>();

        for v in 0..region.height {
            let mut y = region.y.saturating_add(v as i64);
            if method.clamps_rows() {
                y = y.clamp(0, rows as i64 - 1);
            }
            let row_inside = y >= 0 && (y as u64) < rows;
            let mut u = 0u64;
            while u < region.width {
                let x = region.x.saturating_add(u as i64);
                let first = (v * region.width + u) as usize;
                if row_inside && x >= 0 && (x as u64) < columns {
                    let run = (columns - x as u64).min(region.width - u);
                    read_pixels(
                        tier,
                        morphology,
                        x as u64,
                        y as u64,
                        &mut view.scratch[first * channels..][..run as usize * channels],
                        &mut view.meta_scratch[first * extent..][..run as usize * extent],
                    )?;
                    u += run;
                    continue;
                }
                let samples = &mut view.scratch[first * channels..][..channels];
                let meta = &mut view.meta_scratch[first * extent..][..extent];
                match resolve(method, x, y, columns, rows, &mut uniform) {
                    Source::Pixel { x, y } => read_pixels(tier, morphology, x, y, samples, meta)?,
                    Source::Constant => {
                        samples.copy_from_slice(&constant);
                        meta.fill(0);
                    }
                }
                u += 1;
            }
        }
        Ok(())
    }
}

impl Drop for Nexus<'_> {
    fn drop(&mut self) {
        // Views must not survive the claim that guards them.
        self.view.reset();
        self.store.release(self.index);
    }
}
