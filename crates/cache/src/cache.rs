//! Shared, copy-on-write handle to a pixel store.
//!
//! Images hand out [`PixelCache`] references freely; the first writer on a
//! shared or read-only store gets a private copy via [`PixelCache::get_mutable`].

use std::path::Path;
use std::sync::Arc;

use crate::config::CacheContext;
use crate::error::{CacheError, Result};
use crate::morphology::{CacheMode, PixelMorphology};
use crate::registry::StoreId;
use crate::resource::ResourceKind;
use crate::store::{CacheInfo, CacheStore};
use crate::tier::TierKind;

/// Reference-counted pixel cache of one image.
///
/// # Example
///
/// ```
/// use pixel_cache::{CacheMode, PixelCache, PixelMorphology, Region};
///
/// let mut original = PixelCache::new();
/// original.open(PixelMorphology::new(2, 2, 1), CacheMode::ReadWrite).unwrap();
/// original.store().write_region(Region::new(0, 0, 2, 2), &[1, 2, 3, 4]).unwrap();
///
/// let mut copy = original.reference();
/// copy.get_mutable(true).unwrap().write_region(Region::row(0, 0, 2), &[9, 9]).unwrap();
///
/// assert_eq!(original.store().read_authentic(Region::row(0, 0, 2)).unwrap(), vec![1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct PixelCache {
    store: Arc<CacheStore>,
}

impl Default for PixelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelCache {
    /// Empty cache in the process-wide context.
    pub fn new() -> Self {
        Self::with_context(CacheContext::global().clone())
    }

    pub fn with_context(context: CacheContext) -> Self {
        Self {
            store: Arc::new(CacheStore::acquire_in(context, 0)),
        }
    }

    /// Another handle on the same store.
    pub fn reference(&self) -> Self {
        self.clone()
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.store)
    }

    /// The store for reading and nexus access.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn id(&self) -> StoreId {
        self.store.id()
    }

    pub fn tier(&self) -> TierKind {
        self.store.tier()
    }

    pub fn mode(&self) -> CacheMode {
        self.store.mode()
    }

    pub fn morphology(&self) -> &PixelMorphology {
        self.store.morphology()
    }

    pub fn nexus_count(&self) -> usize {
        self.store.nexus_count()
    }

    pub fn info(&self) -> CacheInfo {
        self.store.info()
    }

    /// Exclusive access to the store, copying it first if it is shared or
    /// read-only.
    ///
    /// The copy is opened read-write with the same layout; `deep_copy`
    /// decides whether the pixels come along.
    ///
    /// # Errors
    ///
    /// [`CacheError::TimeLimitExceeded`] once the governor's time budget is
    /// spent, or any error from opening the copy.
    pub fn get_mutable(&mut self, deep_copy: bool) -> Result<&mut CacheStore> {
        let governor = &self.store.context().governor;
        if !governor.try_acquire(ResourceKind::Time, 1) {
            log::error!("{}: time limit exceeded", self.store.id());
            return Err(CacheError::TimeLimitExceeded);
        }
        governor.release(ResourceKind::Time, 1);

        if Arc::strong_count(&self.store) > 1 || self.store.mode() == CacheMode::ReadOnly {
            let mut clone = self.store.clone_empty();
            if self.store.tier() != TierKind::Undefined {
                let morphology = self.store.morphology().clone();
                let source = deep_copy.then_some(&*self.store);
                clone.open_from(morphology, CacheMode::ReadWrite, source)?;
            }
            log::debug!("copy on write {} => {}", self.store.id(), clone.id());
            self.store = Arc::new(clone);
        }

        let id = self.store.id();
        Arc::get_mut(&mut self.store).ok_or_else(|| {
            CacheError::CacheResourcesExhausted(format!("{} is still shared", id))
        })
    }

    /// Size the cache for `morphology` and select a tier, copying first if shared.
    pub fn open(&mut self, morphology: PixelMorphology, mode: CacheMode) -> Result<()> {
        self.get_mutable(true)?.open(morphology, mode)
    }

    /// Bring the cache in line with the image's current layout.
    ///
    /// An unopened cache only records the layout; an opened one is reopened,
    /// which is a no-op when the shape is unchanged.
    pub fn sync_morphology(&mut self, morphology: PixelMorphology) -> Result<()> {
        let store = self.get_mutable(true)?;
        if store.tier() == TierKind::Undefined {
            store.describe(morphology);
            return Ok(());
        }
        let mode = store.mode();
        store.open(morphology, mode)
    }

    /// Store the pixels in the file at `path`, starting at byte `offset`.
    ///
    /// With `attach`, the cache instead adopts pixels already in that file,
    /// read-only; the layout must have been set with
    /// [`sync_morphology`](Self::sync_morphology). Without it, a uniquely held
    /// writable cache that already lives in a private file moves that file to
    /// `path`; any other cache is copied there.
    ///
    /// On success `offset` is advanced past the pixels, rounded up to the page
    /// size so the next image can share the file.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnalignedOffset`] unless `offset` is page aligned, and any
    /// error from opening or filling the file.
    pub fn persist(&mut self, path: impl AsRef<Path>, attach: bool, offset: &mut u64) -> Result<()> {
        let path = path.as_ref();
        let page = page_size();
        if *offset % page != 0 {
            return Err(CacheError::UnalignedOffset(*offset));
        }

        if attach {
            let mut store = self.store.clone_empty();
            store.set_disk_target(path.to_path_buf(), *offset);
            store.open(self.store.morphology().clone(), CacheMode::ReadOnly)?;
            log::debug!("attach {}", store.info());
            self.store = Arc::new(store);
        } else if *offset == 0 && self.can_usurp() {
            self.get_mutable(true)?.usurp(path)?;
        } else if self.store.is_stored_at(path, *offset) {
            // Copying onto itself would read and write the same bytes.
            self.store.flush()?;
        } else {
            let mut store = self.store.clone_empty();
            store.set_disk_target(path.to_path_buf(), *offset);
            store.open_from(self.store.morphology().clone(), CacheMode::ReadWrite, Some(&self.store))?;
            store.flush()?;
            log::debug!("persist {}", store.info());
            self.store = Arc::new(store);
        }

        let length = self.store.length();
        *offset += length.div_ceil(page) * page;
        Ok(())
    }

    fn can_usurp(&self) -> bool {
        Arc::strong_count(&self.store) == 1
            && matches!(self.store.tier(), TierKind::Disk | TierKind::MemoryMapped)
            && self.store.mode().is_writable()
            && !self.store.has_disk_target()
    }
}

/// Virtual memory page size; persisted offsets are multiples of it.
pub fn page_size() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::geometry::Region;
    use crate::resource::ResourceLimits;
    use std::time::Duration;

    fn context(config: CacheConfig) -> CacheContext {
        CacheContext::from_config(&config)
    }

    fn filled(config: CacheConfig, values: &[u16]) -> PixelCache {
        let mut cache = PixelCache::with_context(context(config));
        cache
            .open(PixelMorphology::new(values.len() as u64, 1, 1), CacheMode::ReadWrite)
            .unwrap();
        cache
            .store()
            .write_region(Region::row(0, 0, values.len() as u64), values)
            .unwrap();
        cache
    }

    #[test]
    fn test_unique_cache_is_not_copied() {
        let mut cache = filled(CacheConfig::default(), &[1, 2]);
        let id = cache.id();
        cache.get_mutable(true).unwrap();
        assert_eq!(cache.id(), id);
    }

    #[test]
    fn test_shared_cache_copies_on_write() {
        let mut original = filled(CacheConfig::default(), &[1, 2, 3]);
        let mut copy = original.reference();
        assert_eq!(original.reference_count(), 2);

        copy.get_mutable(true)
            .unwrap()
            .write_region(Region::row(0, 0, 3), &[7, 8, 9])
            .unwrap();

        assert_ne!(copy.id(), original.id());
        assert_eq!(original.reference_count(), 1);
        assert_eq!(original.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![1, 2, 3]);
        assert_eq!(copy.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![7, 8, 9]);

        // The survivor is unique again and mutates in place.
        let id = original.id();
        original.get_mutable(true).unwrap();
        assert_eq!(original.id(), id);
    }

    #[test]
    fn test_shallow_copy_skips_pixels() {
        let original = filled(CacheConfig::default(), &[5, 5]);
        let mut copy = original.reference();
        let store = copy.get_mutable(false).unwrap();
        assert_eq!(store.read_authentic(Region::row(0, 0, 2)).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_time_limit_is_fatal() {
        let config = CacheConfig::default().with_time_limit(Duration::ZERO);
        let mut cache = PixelCache::with_context(context(config));
        let err = cache.get_mutable(true).unwrap_err();
        assert!(matches!(err, CacheError::TimeLimitExceeded));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sync_morphology_defers_allocation() {
        let mut cache = PixelCache::with_context(context(CacheConfig::default()));
        cache.sync_morphology(PixelMorphology::new(3, 3, 1)).unwrap();
        assert_eq!(cache.tier(), TierKind::Undefined);
        assert_eq!(cache.morphology().columns, 3);

        cache.open(PixelMorphology::new(3, 3, 1), CacheMode::ReadWrite).unwrap();
        cache.sync_morphology(PixelMorphology::new(4, 3, 1)).unwrap();
        assert_eq!(cache.store().length(), 24);
    }

    #[test]
    fn test_persist_rejects_unaligned_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = filled(CacheConfig::default(), &[1]);
        let mut offset = 1;
        assert!(matches!(
            cache.persist(dir.path().join("cache"), false, &mut offset),
            Err(CacheError::UnalignedOffset(1))
        ));
    }

    #[test]
    fn test_persist_clone_then_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.cache");
        let config = CacheConfig::default().with_temporary_path(dir.path());

        let mut first = filled(config.clone(), &[1, 2, 3]);
        let mut second = filled(config.clone(), &[4, 5]);
        let mut offset = 0;
        first.persist(&path, false, &mut offset).unwrap();
        assert_eq!(offset, page_size());
        second.persist(&path, false, &mut offset).unwrap();
        assert_eq!(offset, 2 * page_size());
        drop(first);
        drop(second);
        assert!(path.exists());

        let mut offset = 0;
        let mut attached = PixelCache::with_context(context(config.clone()));
        attached.sync_morphology(PixelMorphology::new(3, 1, 1)).unwrap();
        attached.persist(&path, true, &mut offset).unwrap();
        assert_eq!(attached.mode(), CacheMode::ReadOnly);
        assert_eq!(attached.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![1, 2, 3]);

        let mut next = PixelCache::with_context(context(config));
        next.sync_morphology(PixelMorphology::new(2, 1, 1)).unwrap();
        next.persist(&path, true, &mut offset).unwrap();
        assert_eq!(next.store().read_authentic(Region::row(0, 0, 2)).unwrap(), vec![4, 5]);

        // Writing to an attached cache copies it out of the file.
        attached
            .get_mutable(true)
            .unwrap()
            .write_region(Region::row(0, 0, 1), &[100])
            .unwrap();
        assert_eq!(attached.mode(), CacheMode::ReadWrite);
        drop(attached);
        assert!(path.exists());
    }

    #[test]
    fn test_persist_usurps_private_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_temporary_path(dir.path())
            .with_memory_mb(0)
            .with_map_mb(0);
        let mut cache = filled(config, &[3, 1, 4]);
        assert_eq!(cache.tier(), TierKind::Disk);
        let private = cache.store().path().unwrap().to_path_buf();

        let target = dir.path().join("kept.cache");
        let mut offset = 0;
        cache.persist(&target, false, &mut offset).unwrap();

        assert!(!private.exists());
        assert_eq!(cache.store().path(), Some(target.as_path()));
        assert_eq!(cache.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![3, 1, 4]);
        // Persisting again to the same place leaves the file as is.
        let id = cache.id();
        let mut offset = 0;
        cache.persist(&target, false, &mut offset).unwrap();
        assert_eq!(cache.id(), id);
        assert_eq!(cache.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![3, 1, 4]);

        drop(cache);
        assert!(target.exists());
    }

    #[test]
    fn test_reshape_after_persist_keeps_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let mapped = CacheConfig::default()
            .with_temporary_path(dir.path())
            .with_memory_mb(0);
        let disk = mapped.clone().with_map_mb(0);
        for (kind, config) in [(TierKind::MemoryMapped, mapped), (TierKind::Disk, disk)] {
            let mut cache = PixelCache::with_context(context(config));
            cache.open(PixelMorphology::new(2, 2, 1), CacheMode::ReadWrite).unwrap();
            cache
                .store()
                .write_region(Region::new(0, 0, 2, 2), &[1, 2, 3, 4])
                .unwrap();
            assert_eq!(cache.tier(), kind);

            let target = dir.path().join(format!("{}.cache", kind));
            let mut offset = 0;
            cache.persist(&target, false, &mut offset).unwrap();

            cache.sync_morphology(PixelMorphology::new(4, 2, 1)).unwrap();
            assert_eq!(cache.store().path(), Some(target.as_path()));
            assert_eq!(
                cache.store().read_authentic(Region::new(0, 0, 4, 2)).unwrap(),
                vec![1, 2, 0, 0, 3, 4, 0, 0],
                "{}",
                kind
            );
        }
    }

    #[test]
    fn test_failed_usurp_keeps_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_temporary_path(dir.path())
            .with_memory_mb(0)
            .with_map_mb(0);
        let mut cache = filled(config, &[3, 1, 4]);
        let id = cache.id();
        let private = cache.store().path().unwrap().to_path_buf();

        let unreachable = dir.path().join("missing").join("kept.cache");
        let mut offset = 0;
        assert!(matches!(
            cache.persist(&unreachable, false, &mut offset),
            Err(CacheError::Io { .. })
        ));
        assert_eq!(offset, 0);
        assert_eq!(cache.id(), id);
        assert_eq!(cache.tier(), TierKind::Disk);
        assert_eq!(cache.store().path(), Some(private.as_path()));
        assert_eq!(cache.store().read_authentic(Region::row(0, 0, 3)).unwrap(), vec![3, 1, 4]);

        drop(cache);
        assert!(!private.exists());
    }

    #[test]
    fn test_copy_lands_in_same_governor() {
        let limits = Arc::new(ResourceLimits::unlimited());
        let context = CacheContext::with_governor(&CacheConfig::default(), limits.clone());
        let mut original = PixelCache::with_context(context);
        original.open(PixelMorphology::new(4, 4, 1), CacheMode::ReadWrite).unwrap();
        assert_eq!(limits.usage(ResourceKind::Memory), 32);

        let mut copy = original.reference();
        copy.get_mutable(true).unwrap();
        assert_eq!(limits.usage(ResourceKind::Memory), 64);
        drop(copy);
        assert_eq!(limits.usage(ResourceKind::Memory), 32);
    }
}
