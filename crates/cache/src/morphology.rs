//! Sample type and the pixel layout of one image.

use std::mem;

use crate::error::{CacheError, Result};
use crate::geometry::Region;

/// One channel sample.
pub type Quantum = u16;

/// Largest sample value.
pub const QUANTUM_RANGE: Quantum = Quantum::MAX;

/// Alpha value of a fully opaque pixel.
pub const OPAQUE_ALPHA: Quantum = QUANTUM_RANGE;

/// Alpha value of a fully transparent pixel.
pub const TRANSPARENT_ALPHA: Quantum = 0;

pub(crate) const QUANTUM_SIZE: usize = mem::size_of::<Quantum>();

/// Colour model of the samples. Only compared, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Colorspace {
    #[default]
    Undefined,
    Srgb,
    LinearRgb,
    Gray,
    Cmyk,
    Lab,
}

/// Direct samples or palette indices carried in metacontent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageClass {
    #[default]
    Undefined,
    Direct,
    Pseudo,
}

/// Access mode a cache is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl CacheMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, CacheMode::ReadOnly)
    }
}

/// Dimensions and channel layout of an image's pixel array.
///
/// # Example
///
/// ```
/// use pixel_cache::PixelMorphology;
///
/// let rgba = PixelMorphology::new(640, 480, 4).with_alpha_channel(3);
/// assert_eq!(rgba.length().unwrap(), 640 * 480 * 4 * 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelMorphology {
    pub columns: u64,
    pub rows: u64,
    /// Samples per pixel.
    pub channels: u32,
    /// Index of the alpha sample, if the layout has one.
    pub alpha_channel: Option<u32>,
    /// Bytes of metacontent per pixel, 0 if none.
    pub metacontent_extent: u32,
    pub colorspace: Colorspace,
    pub storage_class: StorageClass,
}

impl PixelMorphology {
    pub fn new(columns: u64, rows: u64, channels: u32) -> Self {
        Self {
            columns,
            rows,
            channels,
            alpha_channel: None,
            metacontent_extent: 0,
            colorspace: Colorspace::Srgb,
            storage_class: StorageClass::Direct,
        }
    }

    pub fn with_alpha_channel(mut self, channel: u32) -> Self {
        self.alpha_channel = Some(channel);
        self
    }

    pub fn with_metacontent(mut self, extent: u32) -> Self {
        self.metacontent_extent = extent;
        self
    }

    pub fn with_colorspace(mut self, colorspace: Colorspace) -> Self {
        self.colorspace = colorspace;
        self
    }

    pub fn with_storage_class(mut self, storage_class: StorageClass) -> Self {
        self.storage_class = storage_class;
        self
    }

    /// Same pixel array shape: the byte layout of two caches agrees exactly.
    pub fn same_shape(&self, other: &PixelMorphology) -> bool {
        self.columns == other.columns
            && self.rows == other.rows
            && self.channels == other.channels
            && self.metacontent_extent == other.metacontent_extent
    }

    /// Same shape and same interpretation of the samples.
    pub fn is_compatible(&self, other: &PixelMorphology) -> bool {
        self.same_shape(other)
            && self.alpha_channel == other.alpha_channel
            && self.colorspace == other.colorspace
            && self.storage_class == other.storage_class
    }

    pub fn number_pixels(&self) -> Option<u64> {
        self.columns.checked_mul(self.rows)
    }

    /// Bytes of samples in one pixel.
    pub fn pixel_size(&self) -> usize {
        self.channels as usize * QUANTUM_SIZE
    }

    /// Total byte length of the tier, validated against the addressable size.
    pub fn length(&self) -> Result<u64> {
        let overflow = || {
            CacheError::AllocationFailed(format!(
                "{}x{}x{} (+{} metacontent) overflows the addressable size",
                self.columns, self.rows, self.channels, self.metacontent_extent
            ))
        };
        let packet = (self.channels as u64)
            .checked_mul(QUANTUM_SIZE as u64)
            .and_then(|n| n.checked_add(self.metacontent_extent as u64))
            .ok_or_else(overflow)?;
        let length = self
            .number_pixels()
            .and_then(|n| n.checked_mul(packet))
            .ok_or_else(overflow)?;
        if length > isize::MAX as u64 {
            return Err(overflow());
        }
        Ok(length)
    }

    /// Byte offset of pixel `(x, y)` within the sample section.
    pub(crate) fn pixel_offset(&self, x: u64, y: u64) -> u64 {
        (y * self.columns + x) * self.pixel_size() as u64
    }

    /// Byte offset where the metacontent section starts.
    pub(crate) fn metacontent_base(&self) -> u64 {
        self.columns * self.rows * self.pixel_size() as u64
    }

    /// Byte offset of pixel `(x, y)`'s metacontent block.
    pub(crate) fn metacontent_offset(&self, x: u64, y: u64) -> u64 {
        self.metacontent_base() + (y * self.columns + x) * self.metacontent_extent as u64
    }

    /// Number of samples needed to hold `region`, checked for overflow.
    pub(crate) fn samples_for(&self, region: &Region) -> Result<usize> {
        region
            .area()
            .and_then(|n| n.checked_mul(self.channels as u64))
            .filter(|n| *n <= isize::MAX as u64 / QUANTUM_SIZE as u64)
            .map(|n| n as usize)
            .ok_or_else(|| CacheError::AllocationFailed(format!("region {} is too large", region)))
    }

    /// Number of metacontent bytes needed to hold `region`.
    pub(crate) fn metacontent_for(&self, region: &Region) -> Result<usize> {
        region
            .area()
            .and_then(|n| n.checked_mul(self.metacontent_extent as u64))
            .filter(|n| *n <= isize::MAX as u64)
            .map(|n| n as usize)
            .ok_or_else(|| CacheError::AllocationFailed(format!("region {} is too large", region)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length() {
        let m = PixelMorphology::new(4, 4, 1);
        assert_eq!(m.length().unwrap(), 32);

        let m = PixelMorphology::new(10, 3, 4).with_metacontent(2);
        assert_eq!(m.length().unwrap(), 10 * 3 * (4 * 2 + 2));
    }

    #[test]
    fn test_length_overflow() {
        let m = PixelMorphology::new(u64::MAX / 2, 4, 3);
        assert!(matches!(m.length(), Err(CacheError::AllocationFailed(_))));
    }

    #[test]
    fn test_offsets() {
        let m = PixelMorphology::new(5, 2, 3).with_metacontent(1);
        assert_eq!(m.pixel_offset(0, 0), 0);
        assert_eq!(m.pixel_offset(1, 1), 6 * 6);
        assert_eq!(m.metacontent_base(), 10 * 6);
        assert_eq!(m.metacontent_offset(4, 1), 60 + 9);
    }

    #[test]
    fn test_compatibility() {
        let a = PixelMorphology::new(8, 8, 3);
        let b = a.clone().with_colorspace(Colorspace::Gray);
        assert!(a.same_shape(&b));
        assert!(!a.is_compatible(&b));
        assert!(!a.same_shape(&PixelMorphology::new(8, 9, 3)));
    }
}
