//! Process-wide registry of live stores.
//!
//! The registry exists for one purpose: when the open-descriptor budget runs
//! out, find the disk-backed store that was accessed least recently and close
//! its descriptor. Entries hold only weak references, so registration never
//! extends a store's lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::resource::{governor_key, ResourceGovernor, ResourceGrant, ResourceKind};
use crate::tier::DiskHandle;

/// Process-unique identity of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl StoreId {
    pub(crate) fn next() -> Self {
        StoreId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Registry {
    stores: HashMap<StoreId, Option<Weak<DiskHandle>>>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

pub(crate) fn register(id: StoreId) {
    REGISTRY.lock().stores.insert(id, None);
}

pub(crate) fn deregister(id: StoreId) {
    REGISTRY.lock().stores.remove(&id);
}

/// Make a store's disk descriptor visible to the eviction scan.
pub(crate) fn attach(id: StoreId, handle: &Arc<DiskHandle>) {
    if let Some(slot) = REGISTRY.lock().stores.get_mut(&id) {
        *slot = Some(Arc::downgrade(handle));
    }
}

/// Reserve one `File` unit for `requester`, evicting idle descriptors of other
/// stores that share the same governor until the governor agrees.
///
/// Victims are chosen oldest access first. Fails with
/// [`CacheError::CacheResourcesExhausted`] once no victim is left.
pub(crate) fn reserve_descriptor(
    governor: &Arc<dyn ResourceGovernor>,
    requester: StoreId,
) -> Result<ResourceGrant> {
    let key = governor_key(governor);
    loop {
        if let Some(grant) = ResourceGrant::acquire(governor, ResourceKind::File, 1) {
            return Ok(grant);
        }

        let registry = REGISTRY.lock();
        let victim = registry
            .stores
            .iter()
            .filter(|(id, _)| **id != requester)
            .filter_map(|(_, slot)| slot.as_ref().and_then(Weak::upgrade))
            .filter(|handle| governor_key(handle.governor()) == key)
            .filter_map(|handle| handle.idle_stamp().map(|stamp| (stamp, handle)))
            .min_by_key(|(stamp, _)| *stamp);

        match victim {
            Some((_, handle)) => {
                if handle.try_close() {
                    log::debug!(
                        "evicted descriptor of {} ({})",
                        handle.store(),
                        handle.path().display()
                    );
                }
            }
            None => {
                return Err(CacheError::CacheResourcesExhausted(format!(
                    "no file descriptor available for {} (limit {})",
                    requester,
                    governor.limit(ResourceKind::File)
                )))
            }
        }
    }
}

/// Number of stores currently alive in this process.
pub fn live_store_count() -> usize {
    REGISTRY.lock().stores.len()
}

/// Number of registered disk descriptors currently open.
pub fn open_descriptor_count() -> usize {
    REGISTRY
        .lock()
        .stores
        .values()
        .filter_map(|slot| slot.as_ref().and_then(Weak::upgrade))
        .filter(|handle| handle.is_open())
        .count()
}
