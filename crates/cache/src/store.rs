//! One image's pixel store.
//!
//! A [`CacheStore`] is created empty by [`CacheStore::acquire`], sized and
//! given a storage tier by [`CacheStore::open`], and accessed through
//! per-worker [`Nexus`] views. Tier selection asks the context's
//! [`ResourceGovernor`](crate::ResourceGovernor) for budgets and degrades from
//! memory to a mapped file to plain disk I/O as budgets are denied.

use std::fmt;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::clone::{copy_span, PixelSpan};
use crate::config::CacheContext;
use crate::error::{CacheError, Result};
use crate::geometry::Region;
use crate::mask::PixelMask;
use crate::morphology::{CacheMode, PixelMorphology, Quantum, OPAQUE_ALPHA};
use crate::nexus::{Claim, Nexus, NexusView};
use crate::registry::{self, StoreId};
use crate::resource::{ResourceGrant, ResourceKind};
use crate::tier::{AnonMapTier, DiskHandle, DiskTier, FileMapTier, HeapTier, TempFileGuard, Tier, TierKind};
use crate::virtual_pixel::VirtualPixelMethod;

#[derive(Debug)]
enum Backing {
    Undefined,
    Ping,
    Tier {
        // Dropped before the grants so budgets are returned after the memory is.
        tier: Box<dyn Tier>,
        _grants: Vec<ResourceGrant>,
    },
}

/// Explicit backing file for persisted caches.
#[derive(Debug, Clone)]
struct DiskTarget {
    path: PathBuf,
    offset: u64,
}

/// Pixel storage for one image.
#[derive(Debug)]
pub struct CacheStore {
    id: StoreId,
    morphology: PixelMorphology,
    mode: CacheMode,
    backing: Backing,
    nexus: Vec<Mutex<NexusView>>,
    /// What each slot currently has bound, indexed like `nexus`.
    claims: Mutex<Vec<Option<Claim>>>,
    virtual_pixel_method: VirtualPixelMethod,
    pub(crate) random: Mutex<StdRng>,
    context: CacheContext,
    disk_target: Option<DiskTarget>,
    background: Option<Vec<Quantum>>,
    mask: Option<PixelMask>,
    ping: bool,
}

/// Snapshot of a store's tier and geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub id: StoreId,
    pub tier: TierKind,
    /// Backing description, e.g. "Heap Memory" or "Disk".
    pub backing: &'static str,
    pub columns: u64,
    pub rows: u64,
    pub channels: u32,
    pub metacontent_extent: u32,
    pub length: u64,
    pub mode: CacheMode,
    pub path: Option<PathBuf>,
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}x{}x{} {}B)",
            self.id, self.backing, self.columns, self.rows, self.channels, self.length
        )?;
        if let Some(path) = &self.path {
            write!(f, " {}", path.display())?;
        }
        Ok(())
    }
}

impl CacheStore {
    /// Create an empty store in the process-wide context with `threads` nexus
    /// slots (0 selects the context default).
    pub fn acquire(threads: usize) -> Self {
        Self::acquire_in(CacheContext::global().clone(), threads)
    }

    /// Create an empty store drawing budgets from `context`.
    pub fn acquire_in(context: CacheContext, threads: usize) -> Self {
        let threads = if threads == 0 { context.threads } else { threads };
        let threads = threads.max(1);
        let id = StoreId::next();
        registry::register(id);
        log::trace!("acquire {} with {} nexus slots", id, threads);
        Self {
            id,
            morphology: PixelMorphology::new(0, 0, 0),
            mode: CacheMode::default(),
            backing: Backing::Undefined,
            nexus: (0..threads)
                .map(|_| Mutex::new(NexusView::default()))
                .collect(),
            claims: Mutex::new(vec![None; threads]),
            virtual_pixel_method: VirtualPixelMethod::default(),
            random: Mutex::new(StdRng::from_entropy()),
            context,
            disk_target: None,
            background: None,
            mask: None,
            ping: false,
        }
    }

    /// A new, unopened store with this store's context and image attributes.
    pub fn clone_empty(&self) -> Self {
        let mut clone = Self::acquire_in(self.context.clone(), self.nexus.len());
        clone.morphology = self.morphology.clone();
        clone.virtual_pixel_method = self.virtual_pixel_method;
        clone.background = self.background.clone();
        clone.mask = self.mask.clone();
        clone.ping = self.ping;
        clone
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn morphology(&self) -> &PixelMorphology {
        &self.morphology
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn tier(&self) -> TierKind {
        match &self.backing {
            Backing::Undefined => TierKind::Undefined,
            Backing::Ping => TierKind::Ping,
            Backing::Tier { tier, .. } => tier.kind(),
        }
    }

    /// Byte length of the pixel array, 0 when no tier holds pixels.
    pub fn length(&self) -> u64 {
        match &self.backing {
            Backing::Tier { tier, .. } => tier.len(),
            _ => 0,
        }
    }

    /// Backing file of disk and mapped tiers.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Tier { tier, .. } => tier.path(),
            _ => None,
        }
    }

    pub fn nexus_count(&self) -> usize {
        self.nexus.len()
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    pub fn virtual_pixel_method(&self) -> VirtualPixelMethod {
        self.virtual_pixel_method
    }

    pub fn background(&self) -> Option<&[Quantum]> {
        self.background.as_deref()
    }

    pub fn mask(&self) -> Option<&PixelMask> {
        self.mask.as_ref()
    }

    pub fn is_ping(&self) -> bool {
        self.ping
    }

    pub fn info(&self) -> CacheInfo {
        let backing = match &self.backing {
            Backing::Undefined => "Undefined",
            Backing::Ping => "Ping",
            Backing::Tier { tier, .. } => tier.label(),
        };
        CacheInfo {
            id: self.id,
            tier: self.tier(),
            backing,
            columns: self.morphology.columns,
            rows: self.morphology.rows,
            channels: self.morphology.channels,
            metacontent_extent: self.morphology.metacontent_extent,
            length: self.length(),
            mode: self.mode,
            path: self.path().map(Path::to_path_buf),
        }
    }

    /// Probe mode: the next open records dimensions without allocating pixels.
    pub fn set_ping(&mut self, ping: bool) {
        self.ping = ping;
    }

    pub fn set_background(&mut self, background: &[Quantum]) {
        self.background = Some(background.to_vec());
    }

    pub fn set_mask(&mut self, mask: Option<PixelMask>) {
        self.mask = mask;
        // Masked stores never bind in place; force every view to rebind.
        self.reset_nexus();
    }

    /// Select the out-of-bounds policy and return the previous one.
    ///
    /// `Transparent`, and `Background` with a background that carries an extra
    /// alpha sample, need an alpha channel: a writable store without one is
    /// reopened with an opaque alpha channel appended to every pixel.
    pub fn set_virtual_pixel_method(&mut self, method: VirtualPixelMethod) -> Result<VirtualPixelMethod> {
        let previous = mem::replace(&mut self.virtual_pixel_method, method);
        let channels = self.morphology.channels as usize;
        let wants_alpha = match method {
            VirtualPixelMethod::Transparent => true,
            VirtualPixelMethod::Background => self
                .background
                .as_ref()
                .is_some_and(|background| background.len() > channels),
            _ => false,
        };
        if wants_alpha
            && self.morphology.alpha_channel.is_none()
            && self.tier().has_pixels()
            && self.mode.is_writable()
        {
            self.activate_alpha()?;
        }
        Ok(previous)
    }

    /// Append an opaque alpha channel to every pixel.
    fn activate_alpha(&mut self) -> Result<()> {
        let channels = self.morphology.channels;
        let mut morphology = self.morphology.clone();
        morphology.channels = channels + 1;
        morphology.alpha_channel = Some(channels);
        let mode = self.mode;
        self.open(morphology, mode)?;

        let columns = self.morphology.columns;
        let mut nexus = self.nexus(0)?;
        for y in 0..self.morphology.rows {
            let row = nexus.get_authentic(Region::row(0, y as i64, columns))?;
            for pixel in row.chunks_mut(channels as usize + 1) {
                if let Some(alpha) = pixel.last_mut() {
                    *alpha = OPAQUE_ALPHA;
                }
            }
            nexus.sync()?;
        }
        log::debug!("{} alpha channel activated", self.id);
        Ok(())
    }

    /// Make the random virtual-pixel policy reproducible.
    pub fn set_random_seed(&mut self, seed: u64) {
        *self.random.get_mut() = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn set_disk_target(&mut self, path: PathBuf, offset: u64) {
        self.disk_target = Some(DiskTarget { path, offset });
    }

    pub(crate) fn has_disk_target(&self) -> bool {
        self.disk_target.is_some()
    }

    /// Whether the pixels already live in `path` at `offset`.
    pub(crate) fn is_stored_at(&self, path: &Path, offset: u64) -> bool {
        self.tier().has_pixels()
            && self
                .disk_target
                .as_ref()
                .is_some_and(|target| target.path == path && target.offset == offset)
    }

    /// Record the layout of a store that has no tier yet.
    pub(crate) fn describe(&mut self, morphology: PixelMorphology) {
        debug_assert_eq!(self.tier(), TierKind::Undefined);
        self.morphology = morphology;
    }

    /// Lock nexus slot `index` for the calling worker.
    ///
    /// Blocks while another worker holds the same slot.
    pub fn nexus(&self, index: usize) -> Result<Nexus<'_>> {
        let slot = self.nexus.get(index).ok_or(CacheError::InvalidNexus {
            index,
            slots: self.nexus.len(),
        })?;
        Ok(Nexus::new(self, slot.lock(), index))
    }

    /// Lock the first slot no one holds, without blocking.
    fn idle_nexus(&self) -> Result<Nexus<'_>> {
        self.nexus
            .iter()
            .enumerate()
            .find_map(|(index, slot)| slot.try_lock().map(|view| Nexus::new(self, view, index)))
            .ok_or(CacheError::NexusBusy {
                slots: self.nexus.len(),
            })
    }

    /// Record what slot `index` binds next, refusing overlaps with other slots.
    pub(crate) fn claim(&self, index: usize, claim: Claim, region: Region) -> Result<()> {
        let mut claims = self.claims.lock();
        if let Some(own) = claims.get_mut(index) {
            *own = None;
        }
        if let Some(nexus) = claims
            .iter()
            .position(|other| other.is_some_and(|other| other.conflicts(&claim)))
        {
            return Err(CacheError::RegionInUse { region, nexus });
        }
        if let Some(own) = claims.get_mut(index) {
            *own = Some(claim);
        }
        Ok(())
    }

    pub(crate) fn release(&self, index: usize) {
        if let Some(own) = self.claims.lock().get_mut(index) {
            *own = None;
        }
    }

    /// The tier holding pixels, or why there is none.
    pub(crate) fn pixel_tier(&self) -> Result<&dyn Tier> {
        match &self.backing {
            Backing::Undefined => Err(CacheError::CacheNotOpen),
            Backing::Ping => Err(CacheError::NoPixelsDefinedInCache),
            Backing::Tier { tier, .. } => Ok(tier.as_ref()),
        }
    }

    pub(crate) fn span(&self) -> Result<PixelSpan<'_>> {
        Ok(PixelSpan {
            tier: self.pixel_tier()?,
            morphology: &self.morphology,
        })
    }

    /// Size the store for `morphology` and select a tier.
    ///
    /// Reopening with the same shape and mode is a no-op. Reopening with a new
    /// shape keeps the overlapping pixels and zeroes the rest.
    ///
    /// # Errors
    ///
    /// [`CacheError::NoPixelsDefinedInCache`] for empty images,
    /// [`CacheError::AllocationFailed`] if the size overflows, and
    /// [`CacheError::CacheResourcesExhausted`] if even the disk budget is denied.
    pub fn open(&mut self, morphology: PixelMorphology, mode: CacheMode) -> Result<()> {
        self.open_from(morphology, mode, None)
    }

    /// Like [`open`](Self::open), then copy the pixels of `source` into the new
    /// tier unless the store is read-only.
    pub fn open_from(
        &mut self,
        morphology: PixelMorphology,
        mode: CacheMode,
        source: Option<&CacheStore>,
    ) -> Result<()> {
        if morphology.columns == 0 || morphology.rows == 0 || morphology.channels == 0 {
            return Err(CacheError::NoPixelsDefinedInCache);
        }
        let length = morphology.length()?;

        if self.ping {
            self.backing = Backing::Ping;
            self.morphology = morphology;
            self.mode = mode;
            self.reset_nexus();
            log::debug!("open {}", self.info());
            return Ok(());
        }

        if source.is_none()
            && mode == self.mode
            && self.tier().has_pixels()
            && self.morphology.same_shape(&morphology)
        {
            self.morphology = morphology;
            return Ok(());
        }

        // A persisted store reopens over its own file: stage the old pixels
        // elsewhere so the copy never reads bytes it already overwrote.
        let staged = if source.is_none() && mode.is_writable() && self.reopens_in_place() {
            let mut staging = self.clone_empty();
            staging.disk_target = None;
            staging.open_from(self.morphology.clone(), CacheMode::ReadWrite, Some(&*self))?;
            log::debug!("{} staged in {} before reopening", self.id, staging.id);
            Some(staging)
        } else {
            None
        };
        let source = source.or(staged.as_ref());

        let (tier, grants) = self.select_tier(mode, length)?;

        if mode.is_writable() {
            let destination = PixelSpan {
                tier: tier.as_ref(),
                morphology: &morphology,
            };
            match source {
                Some(source) if source.tier().has_pixels() => {
                    copy_span(&destination, &source.span()?)?;
                }
                Some(_) => {}
                None => {
                    if let Backing::Tier { tier: previous, .. } = &self.backing {
                        let previous = PixelSpan {
                            tier: previous.as_ref(),
                            morphology: &self.morphology,
                        };
                        copy_span(&destination, &previous)?;
                    }
                }
            }
        }

        self.backing = Backing::Tier {
            tier,
            _grants: grants,
        };
        self.morphology = morphology;
        self.mode = mode;
        self.reset_nexus();
        log::debug!("open {}", self.info());
        Ok(())
    }

    /// Whether the current tier already lives in the disk target.
    fn reopens_in_place(&self) -> bool {
        match (&self.backing, &self.disk_target) {
            (Backing::Tier { tier, .. }, Some(target)) => tier.path() == Some(target.path.as_path()),
            _ => false,
        }
    }

    fn select_tier(&self, mode: CacheMode, length: u64) -> Result<(Box<dyn Tier>, Vec<ResourceGrant>)> {
        let governor = &self.context.governor;
        if self.disk_target.is_none() {
            match ResourceGrant::acquire(governor, ResourceKind::Area, length) {
                Some(area) => match ResourceGrant::acquire(governor, ResourceKind::Memory, length) {
                    Some(memory) => {
                        if let Some(tier) = self.memory_tier(length) {
                            return Ok((tier, vec![area, memory]));
                        }
                    }
                    None => log::warn!(
                        "{}: memory budget denied for {} bytes, falling back to disk",
                        self.id,
                        length
                    ),
                },
                None => log::warn!(
                    "{}: {} bytes exceeds the area limit, falling back to disk",
                    self.id,
                    length
                ),
            }
        }
        self.disk_tier(mode, length)
    }

    fn memory_tier(&self, length: u64) -> Option<Box<dyn Tier>> {
        if !self.context.anonymous_memory {
            if let Some(heap) = HeapTier::allocate(length) {
                return Some(Box::new(heap));
            }
            log::warn!(
                "{}: heap allocation of {} bytes failed, trying an anonymous map",
                self.id,
                length
            );
        }
        match AnonMapTier::map(length) {
            Ok(map) => Some(Box::new(map)),
            Err(err) => {
                log::warn!("{}: {}", self.id, err);
                None
            }
        }
    }

    fn disk_tier(&self, mode: CacheMode, length: u64) -> Result<(Box<dyn Tier>, Vec<ResourceGrant>)> {
        let governor = &self.context.governor;
        let disk = ResourceGrant::acquire(governor, ResourceKind::Disk, length).ok_or_else(|| {
            CacheError::CacheResourcesExhausted(format!(
                "disk budget denied {} bytes for {}",
                length, self.id
            ))
        })?;

        let (path, offset, temp) = match &self.disk_target {
            Some(target) => (target.path.clone(), target.offset, TempFileGuard::none()),
            None => {
                let path = temporary_file(&self.context.temporary_path)?;
                (path.clone(), 0, TempFileGuard::owned(path))
            }
        };
        let end = offset
            .checked_add(length)
            .ok_or_else(|| CacheError::AllocationFailed(format!("offset {} + {} bytes", offset, length)))?;

        let handle = Arc::new(DiskHandle::new(self.id, path.clone(), mode, Arc::clone(governor)));
        if mode.is_writable() {
            handle.extend(end)?;
        } else {
            let available = handle
                .file()?
                .metadata()
                .map_err(|err| CacheError::io(&path, err))?
                .len();
            if available < end {
                return Err(CacheError::ShortRead {
                    path,
                    offset,
                    expected: length as usize,
                    actual: available.saturating_sub(offset) as usize,
                });
            }
        }

        match ResourceGrant::acquire(governor, ResourceKind::Map, length) {
            Some(map) => {
                let file = handle.file()?;
                match FileMapTier::map(&file, &path, offset, length, mode) {
                    Ok(tier) => {
                        // The mapping keeps the file referenced.
                        drop(file);
                        handle.close();
                        return Ok((Box::new(tier.with_temp(temp)), vec![disk, map]));
                    }
                    Err(err) => log::warn!("{}: {}, using positional I/O", self.id, err),
                }
            }
            None => log::warn!(
                "{}: map budget denied for {} bytes, using positional I/O",
                self.id,
                length
            ),
        }
        Ok((
            Box::new(DiskTier::new(handle, offset, length, temp)),
            vec![disk],
        ))
    }

    /// Move a private cache file to `path` and keep using it from there.
    ///
    /// The current tier stays in place until the file has reached `path`, so a
    /// failed move leaves the store untouched.
    pub(crate) fn usurp(&mut self, path: &Path) -> Result<()> {
        let current = self
            .path()
            .map(Path::to_path_buf)
            .ok_or(CacheError::CacheNotOpen)?;
        self.flush()?;

        let renamed = match fs::rename(&current, path) {
            Ok(()) => true,
            Err(err) => {
                // Different filesystems: copy; the original goes with the old tier.
                log::debug!("{}: rename to {} failed ({}), copying", self.id, path.display(), err);
                fs::copy(&current, path).map_err(|err| CacheError::io(path, err))?;
                false
            }
        };
        if let Backing::Tier { tier, .. } = &mut self.backing {
            if renamed {
                tier.keep_file();
            }
        }
        self.backing = Backing::Undefined;
        log::debug!("{} moved {} to {}", self.id, current.display(), path.display());

        self.set_disk_target(path.to_path_buf(), 0);
        let morphology = self.morphology.clone();
        let mode = self.mode;
        self.open(morphology, mode)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        match &self.backing {
            Backing::Tier { tier, .. } => tier.flush(),
            _ => Ok(()),
        }
    }

    fn reset_nexus(&mut self) {
        for slot in &mut self.nexus {
            slot.get_mut().reset();
        }
        self.claims.get_mut().fill(None);
    }

    /// Write `samples` into an in-bounds region through the first idle nexus slot.
    ///
    /// # Errors
    ///
    /// [`CacheError::NexusBusy`] when every slot is held, besides the errors of
    /// [`Nexus::queue_authentic`] and [`Nexus::sync`].
    pub fn write_region(&self, region: Region, samples: &[Quantum]) -> Result<()> {
        let mut nexus = self.idle_nexus()?;
        let pixels = nexus.queue_authentic(region)?;
        if pixels.len() != samples.len() {
            return Err(CacheError::SampleCountMismatch {
                expected: pixels.len(),
                actual: samples.len(),
            });
        }
        pixels.copy_from_slice(samples);
        nexus.sync()
    }

    /// Copy of the samples in an in-bounds region, read through the first idle slot.
    pub fn read_authentic(&self, region: Region) -> Result<Vec<Quantum>> {
        let mut nexus = self.idle_nexus()?;
        Ok(nexus.get_authentic(region)?.to_vec())
    }

    /// Copy of the samples in any region, resolving outside pixels with `method`.
    pub fn read_virtual(&self, method: VirtualPixelMethod, region: Region) -> Result<Vec<Quantum>> {
        let mut nexus = self.idle_nexus()?;
        Ok(nexus.get_virtual(method, region)?.to_vec())
    }

    /// Samples of the pixel at `(x, y)`, which must lie inside the image.
    pub fn one_authentic_pixel(&self, x: i64, y: i64) -> Result<Vec<Quantum>> {
        self.read_authentic(Region::new(x, y, 1, 1))
    }

    /// Samples of the pixel at `(x, y)`, resolved with the store's
    /// virtual-pixel method when it lies outside the image.
    pub fn one_virtual_pixel(&self, x: i64, y: i64) -> Result<Vec<Quantum>> {
        self.read_virtual(self.virtual_pixel_method, Region::new(x, y, 1, 1))
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        registry::deregister(self.id);
        if self.tier() != TierKind::Undefined {
            log::debug!("destroy {}", self.info());
        }
    }
}

fn temporary_file(dir: &Path) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("pixel-cache-")
        .tempfile_in(dir)
        .map_err(|source| CacheError::FileOpenFailed {
            path: dir.to_path_buf(),
            source,
        })?;
    file.into_temp_path()
        .keep()
        .map_err(|err| CacheError::io(dir, err.error))
}
