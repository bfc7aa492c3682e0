//! Error types for the pixel cache.

use std::io;
use std::path::PathBuf;

use crate::geometry::Region;

/// Errors surfaced by cache operations.
///
/// Tier-selection fallbacks are handled inside [`CacheStore::open`](crate::CacheStore::open);
/// only final exhaustion reaches the caller. Interrupted system calls are retried by the
/// disk tier and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Arithmetic overflow while sizing the cache, or the allocator refused the request.
    #[error("pixel cache allocation failed: {0}")]
    AllocationFailed(String),

    /// Every tier was denied by the resource governor.
    #[error("cache resources exhausted: {0}")]
    CacheResourcesExhausted(String),

    #[error("unable to open pixel cache file {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("short read from {path} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("short write to {path} at offset {offset}: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        path: PathBuf,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An authentic (in-bounds) request fell outside the image.
    #[error("pixels are not authentic: region {0} lies outside the image")]
    PixelsAreNotAuthentic(Region),

    #[error("no pixels defined in cache")]
    NoPixelsDefinedInCache,

    #[error("empty region {0}")]
    EmptyRegion(Region),

    /// A caller buffer does not match the bound region.
    #[error("expected {expected} samples, got {actual}")]
    SampleCountMismatch { expected: usize, actual: usize },

    #[error("pixel cache is not open")]
    CacheNotOpen,

    #[error("nexus slot {index} out of range (slots={slots})")]
    InvalidNexus { index: usize, slots: usize },

    /// Every nexus slot is held by another worker.
    #[error("all {slots} nexus slots are in use")]
    NexusBusy { slots: usize },

    /// The region overlaps one that another nexus has bound, and one of the two
    /// binds may write.
    #[error("region {region} overlaps the region bound by nexus {nexus}")]
    RegionInUse { region: Region, nexus: usize },

    #[error("pixel cache is read-only")]
    ReadOnlyCache,

    #[error("cache file offset {0} is not page aligned")]
    UnalignedOffset(u64),

    #[error("time limit exceeded")]
    TimeLimitExceeded,
}

impl CacheError {
    /// Fatal errors abort the operation using the store and are not worth retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::AllocationFailed(_) | CacheError::TimeLimitExceeded
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CacheError::AllocationFailed("overflow".into()).is_fatal());
        assert!(CacheError::TimeLimitExceeded.is_fatal());
        assert!(!CacheError::NoPixelsDefinedInCache.is_fatal());
        assert!(!CacheError::CacheResourcesExhausted("disk".into()).is_fatal());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = CacheError::ShortRead {
            path: PathBuf::from("/tmp/cache-a"),
            offset: 64,
            expected: 32,
            actual: 7,
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/cache-a"));
        assert!(message.contains("64"));

        let region = Region::new(-1, 0, 2, 2);
        let message = CacheError::PixelsAreNotAuthentic(region).to_string();
        assert!(message.contains("2x2-1+0"));
    }
}
