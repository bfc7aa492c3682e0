//! Rectangular regions and floored modulo arithmetic.

use std::fmt;

/// A rectangle in image coordinates.
///
/// The origin may be negative or beyond the image extent; virtual-pixel reads
/// accept such regions, authentic reads reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
    pub x: i64,
    pub y: i64,
    pub width: u64,
    pub height: u64,
}

impl Region {
    pub fn new(x: i64, y: i64, width: u64, height: u64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A single row starting at `(x, y)`.
    pub fn row(x: i64, y: i64, width: u64) -> Self {
        Self::new(x, y, width, 1)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered, or `None` on overflow.
    pub fn area(&self) -> Option<u64> {
        self.width.checked_mul(self.height)
    }

    /// True if the whole region lies within `[0,columns) x [0,rows)`.
    pub fn is_within(&self, columns: u64, rows: u64) -> bool {
        if self.x < 0 || self.y < 0 {
            return false;
        }
        let right = (self.x as u128) + (self.width as u128);
        let bottom = (self.y as u128) + (self.height as u128);
        right <= columns as u128 && bottom <= rows as u128
    }

    /// True if the two regions share at least one pixel.
    pub fn intersects(&self, other: &Region) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let span = |start: i64, extent: u64| (start as i128, start as i128 + extent as i128);
        let (left, right) = span(self.x, self.width);
        let (top, bottom) = span(self.y, self.height);
        let (other_left, other_right) = span(other.x, other.width);
        let (other_top, other_bottom) = span(other.y, other.height);
        left < other_right && other_left < right && top < other_bottom && other_top < bottom
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}{:+}{:+}", self.width, self.height, self.x, self.y)
    }
}

/// Quotient and remainder of a floored division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulo {
    pub quotient: i64,
    pub remainder: i64,
}

/// Divide `offset` by `extent` rounding toward negative infinity.
///
/// Unlike `/` and `%`, the remainder always lands in `[0, extent)`, so tiling and
/// mirroring behave the same on both sides of the origin.
///
/// # Panics
///
/// Panics if `extent` is zero.
pub fn floored_divmod(offset: i64, extent: u64) -> Modulo {
    assert!(extent > 0, "floored_divmod requires a positive extent");
    let extent = extent.min(i64::MAX as u64) as i64;
    Modulo {
        quotient: offset.div_euclid(extent),
        remainder: offset.rem_euclid(extent),
    }
}
