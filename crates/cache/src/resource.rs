//! Resource budgets consulted when choosing a storage tier.
//!
//! The cache never decides on its own whether it may use more memory, map more
//! files or open another descriptor: it asks a [`ResourceGovernor`]. The
//! [`ResourceLimits`] governor tracks usage with atomic counters so stores on
//! different threads can share one budget without locking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, UNLIMITED};

/// Kinds of resource a cache can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Largest single pixel array allowed in memory or mapped tiers
    Area,
    /// Heap bytes
    Memory,
    /// Memory-mapped bytes
    Map,
    /// Bytes in cache files
    Disk,
    /// Open cache file descriptors
    File,
    /// Wall-clock seconds
    Time,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Area => "area",
            ResourceKind::Memory => "memory",
            ResourceKind::Map => "map",
            ResourceKind::Disk => "disk",
            ResourceKind::File => "file",
            ResourceKind::Time => "time",
        };
        f.write_str(name)
    }
}

/// Grants or denies resource budgets.
///
/// Implementations must be thread safe; every tier decision calls into the
/// governor synchronously.
pub trait ResourceGovernor: Send + Sync + fmt::Debug {
    /// Try to take `amount` units of `kind`. Returns false if the budget is exhausted.
    fn try_acquire(&self, kind: ResourceKind, amount: u64) -> bool;

    /// Return `amount` units of `kind` taken by an earlier successful `try_acquire`.
    fn release(&self, kind: ResourceKind, amount: u64);

    /// Configured ceiling for `kind`.
    fn limit(&self, kind: ResourceKind) -> u64;
}

/// Counter-based governor with fixed ceilings.
///
/// # Example
///
/// ```
/// use pixel_cache::{CacheConfig, ResourceGovernor, ResourceKind, ResourceLimits};
///
/// let limits = ResourceLimits::new(&CacheConfig::default().with_file_limit(1));
/// assert!(limits.try_acquire(ResourceKind::File, 1));
/// assert!(!limits.try_acquire(ResourceKind::File, 1));
/// limits.release(ResourceKind::File, 1);
/// assert_eq!(limits.usage(ResourceKind::File), 0);
/// ```
#[derive(Debug)]
pub struct ResourceLimits {
    area_limit: u64,
    memory: Counter,
    map: Counter,
    disk: Counter,
    file: Counter,
    time_limit: Option<Duration>,
    started: Instant,
}

#[derive(Debug)]
struct Counter {
    used: AtomicU64,
    limit: u64,
}

impl Counter {
    fn new(limit: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            limit,
        }
    }

    fn try_acquire(&self, amount: u64) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(amount).filter(|total| *total <= self.limit)
            })
            .is_ok()
    }

    fn release(&self, amount: u64) {
        // Saturate so a stray double release cannot wrap the counter.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(amount))
            });
    }

    fn usage(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

impl ResourceLimits {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            area_limit: config.area_limit,
            memory: Counter::new(config.memory_limit),
            map: Counter::new(config.map_limit),
            disk: Counter::new(config.disk_limit),
            file: Counter::new(config.file_limit),
            time_limit: config.time_limit,
            started: Instant::now(),
        }
    }

    /// Governor that grants everything.
    pub fn unlimited() -> Self {
        let config = CacheConfig {
            area_limit: UNLIMITED,
            memory_limit: UNLIMITED,
            map_limit: UNLIMITED,
            disk_limit: UNLIMITED,
            file_limit: UNLIMITED,
            time_limit: None,
            ..CacheConfig::default()
        };
        Self::new(&config)
    }

    /// Units of `kind` currently held. Area is never accumulated and reports 0;
    /// time reports elapsed seconds.
    pub fn usage(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Area => 0,
            ResourceKind::Memory => self.memory.usage(),
            ResourceKind::Map => self.map.usage(),
            ResourceKind::Disk => self.disk.usage(),
            ResourceKind::File => self.file.usage(),
            ResourceKind::Time => self.started.elapsed().as_secs(),
        }
    }

    fn counter(&self, kind: ResourceKind) -> Option<&Counter> {
        match kind {
            ResourceKind::Memory => Some(&self.memory),
            ResourceKind::Map => Some(&self.map),
            ResourceKind::Disk => Some(&self.disk),
            ResourceKind::File => Some(&self.file),
            ResourceKind::Area | ResourceKind::Time => None,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl ResourceGovernor for ResourceLimits {
    fn try_acquire(&self, kind: ResourceKind, amount: u64) -> bool {
        match kind {
            ResourceKind::Area => amount <= self.area_limit,
            ResourceKind::Time => match self.time_limit {
                Some(limit) => self.started.elapsed() < limit,
                None => true,
            },
            _ => self
                .counter(kind)
                .map(|counter| counter.try_acquire(amount))
                .unwrap_or(false),
        }
    }

    fn release(&self, kind: ResourceKind, amount: u64) {
        if let Some(counter) = self.counter(kind) {
            counter.release(amount);
        }
    }

    fn limit(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Area => self.area_limit,
            ResourceKind::Time => self
                .time_limit
                .map(|limit| limit.as_secs())
                .unwrap_or(UNLIMITED),
            _ => self.counter(kind).map(|c| c.limit).unwrap_or(UNLIMITED),
        }
    }
}

/// A budget held until dropped.
#[derive(Debug)]
pub struct ResourceGrant {
    governor: Arc<dyn ResourceGovernor>,
    kind: ResourceKind,
    amount: u64,
}

impl ResourceGrant {
    /// Ask `governor` for `amount` units of `kind`.
    pub fn acquire(
        governor: &Arc<dyn ResourceGovernor>,
        kind: ResourceKind,
        amount: u64,
    ) -> Option<Self> {
        if governor.try_acquire(kind, amount) {
            Some(Self {
                governor: Arc::clone(governor),
                kind,
                amount,
            })
        } else {
            None
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for ResourceGrant {
    fn drop(&mut self) {
        self.governor.release(self.kind, self.amount);
    }
}

/// Identity of a governor, comparable across trait objects.
pub(crate) fn governor_key(governor: &Arc<dyn ResourceGovernor>) -> usize {
    Arc::as_ptr(governor) as *const () as usize
}
