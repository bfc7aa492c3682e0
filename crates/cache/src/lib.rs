//! Pixel Cache Library
//!
//! Tiered pixel storage for images: heap or anonymous memory, memory-mapped
//! files and positional disk I/O, selected per image from resource budgets.
//! Workers access rectangular regions through per-thread nexus views, with
//! virtual pixels synthesised for coordinates outside the image.

mod cache;
mod clone;
mod config;
mod error;
mod geometry;
mod mask;
mod morphology;
mod nexus;
mod parallel;
mod registry;
mod resource;
mod store;
mod tier;
mod virtual_pixel;

pub use cache::{page_size, PixelCache};
pub use clone::clone_pixels;
pub use config::{CacheConfig, CacheContext, ConfigError, UNLIMITED};
pub use error::{CacheError, Result};
pub use geometry::{floored_divmod, Modulo, Region};
pub use mask::{MaskKind, PixelMask};
pub use morphology::{
    CacheMode, Colorspace, PixelMorphology, Quantum, StorageClass, OPAQUE_ALPHA, QUANTUM_RANGE,
    TRANSPARENT_ALPHA,
};
pub use nexus::Nexus;
pub use parallel::for_each_row_band;
pub use registry::{live_store_count, open_descriptor_count, StoreId};
pub use resource::{ResourceGovernor, ResourceGrant, ResourceKind, ResourceLimits};
pub use store::{CacheInfo, CacheStore};
pub use tier::TierKind;
pub use virtual_pixel::VirtualPixelMethod;
