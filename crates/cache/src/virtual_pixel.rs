//! Out-of-bounds pixel policies.
//!
//! A virtual read may ask for pixels outside `[0,columns) x [0,rows)`. Each
//! such pixel is resolved to either an in-bounds source pixel or a constant
//! colour, depending on the [`VirtualPixelMethod`].

use crate::geometry::floored_divmod;
use crate::morphology::{PixelMorphology, Quantum, OPAQUE_ALPHA, QUANTUM_RANGE, TRANSPARENT_ALPHA};

/// Policy for pixels requested outside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VirtualPixelMethod {
    /// Same as [`VirtualPixelMethod::Edge`].
    #[default]
    Undefined,
    Background,
    Black,
    CheckerTile,
    Dither,
    Edge,
    Gray,
    HorizontalTile,
    HorizontalTileEdge,
    Mask,
    Mirror,
    Random,
    Tile,
    Transparent,
    VerticalTile,
    VerticalTileEdge,
    White,
}

impl VirtualPixelMethod {
    /// Policies that never read the image.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            VirtualPixelMethod::Background
                | VirtualPixelMethod::Black
                | VirtualPixelMethod::Gray
                | VirtualPixelMethod::Mask
                | VirtualPixelMethod::Transparent
                | VirtualPixelMethod::White
        )
    }

    /// Whether the row is clamped before its columns are resolved.
    pub(crate) fn clamps_rows(&self) -> bool {
        matches!(self, VirtualPixelMethod::Edge | VirtualPixelMethod::Undefined)
    }
}

/// Where a virtual pixel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Pixel { x: u64, y: u64 },
    Constant,
}

/// Ordered-dither offsets; only the first row is consulted per axis.
const DITHER_MATRIX: [i64; 64] = [
    0, 48, 12, 60, 3, 51, 15, 63, //
    32, 16, 44, 28, 35, 19, 47, 31, //
    8, 56, 4, 52, 11, 59, 7, 55, //
    40, 24, 36, 20, 43, 27, 39, 23, //
    2, 50, 14, 62, 1, 49, 13, 61, //
    34, 18, 46, 30, 33, 17, 45, 29, //
    10, 58, 6, 54, 9, 57, 5, 53, //
    42, 26, 38, 22, 41, 25, 37, 21,
];

fn edge(offset: i64, extent: u64) -> u64 {
    if offset < 0 {
        0
    } else {
        (offset as u64).min(extent - 1)
    }
}

fn dither(offset: i64, extent: u64) -> u64 {
    let index = offset.saturating_add(DITHER_MATRIX[(offset & 0x07) as usize] - 32);
    edge(index, extent)
}

fn tile(offset: i64, extent: u64) -> u64 {
    floored_divmod(offset, extent).remainder as u64
}

fn mirror(offset: i64, extent: u64) -> u64 {
    let modulo = floored_divmod(offset, extent);
    if modulo.quotient & 0x01 == 1 {
        extent - modulo.remainder as u64 - 1
    } else {
        modulo.remainder as u64
    }
}

fn random(uniform: &mut impl FnMut() -> f64, extent: u64) -> u64 {
    let draw = (extent as f64 * uniform()) as u64;
    draw.min(extent - 1)
}

/// Resolve the pixel at `(x, y)` of an image `columns` x `rows` (both non-zero).
///
/// Callers only consult this for pixels outside the image. `uniform` yields
/// draws in `[0, 1)` and is only called by the random policy.
pub(crate) fn resolve(
    method: VirtualPixelMethod,
    x: i64,
    y: i64,
    columns: u64,
    rows: u64,
    uniform: &mut impl FnMut() -> f64,
) -> Source {
    let inside = |offset: i64, extent: u64| offset >= 0 && (offset as u64) < extent;
    let pixel = |x: u64, y: u64| Source::Pixel { x, y };

    match method {
        VirtualPixelMethod::Undefined | VirtualPixelMethod::Edge => {
            pixel(edge(x, columns), edge(y, rows))
        }
        VirtualPixelMethod::Random => {
            let x = random(uniform, columns);
            pixel(x, random(uniform, rows))
        }
        VirtualPixelMethod::Dither => pixel(dither(x, columns), dither(y, rows)),
        VirtualPixelMethod::Tile => pixel(tile(x, columns), tile(y, rows)),
        VirtualPixelMethod::Mirror => pixel(mirror(x, columns), mirror(y, rows)),
        VirtualPixelMethod::HorizontalTileEdge => pixel(tile(x, columns), edge(y, rows)),
        VirtualPixelMethod::VerticalTileEdge => pixel(edge(x, columns), tile(y, rows)),
        VirtualPixelMethod::CheckerTile => {
            let xm = floored_divmod(x, columns);
            let ym = floored_divmod(y, rows);
            if (xm.quotient ^ ym.quotient) & 0x01 != 0 {
                Source::Constant
            } else {
                pixel(xm.remainder as u64, ym.remainder as u64)
            }
        }
        VirtualPixelMethod::HorizontalTile => {
            if inside(y, rows) {
                pixel(tile(x, columns), y as u64)
            } else {
                Source::Constant
            }
        }
        VirtualPixelMethod::VerticalTile => {
            if inside(x, columns) {
                pixel(x as u64, tile(y, rows))
            } else {
                Source::Constant
            }
        }
        VirtualPixelMethod::Background
        | VirtualPixelMethod::Black
        | VirtualPixelMethod::Gray
        | VirtualPixelMethod::Mask
        | VirtualPixelMethod::Transparent
        | VirtualPixelMethod::White => Source::Constant,
    }
}

/// The constant pixel a method substitutes for out-of-bounds reads.
///
/// Black, gray and white fill every colour channel and leave the alpha
/// channel opaque; transparent zeroes everything. Background and mask use the
/// image background (opaque white when unset), padded with zeros if it is
/// shorter than a pixel.
pub(crate) fn constant_pixel(
    method: VirtualPixelMethod,
    morphology: &PixelMorphology,
    background: Option<&[Quantum]>,
) -> Vec<Quantum> {
    let channels = morphology.channels as usize;
    let fill = |value: Quantum| {
        let mut pixel = vec![value; channels];
        if let Some(alpha) = morphology.alpha_channel {
            if let Some(sample) = pixel.get_mut(alpha as usize) {
                *sample = OPAQUE_ALPHA;
            }
        }
        pixel
    };
    match method {
        VirtualPixelMethod::Black => fill(0),
        VirtualPixelMethod::Gray => fill(QUANTUM_RANGE / 2),
        VirtualPixelMethod::White => fill(QUANTUM_RANGE),
        VirtualPixelMethod::Transparent => {
            let mut pixel = vec![0; channels];
            if let Some(alpha) = morphology.alpha_channel {
                if let Some(sample) = pixel.get_mut(alpha as usize) {
                    *sample = TRANSPARENT_ALPHA;
                }
            }
            pixel
        }
        _ => match background {
            Some(background) => {
                let mut pixel = vec![0; channels];
                for (sample, value) in pixel.iter_mut().zip(background) {
                    *sample = *value;
                }
                pixel
            }
            None => fill(QUANTUM_RANGE),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn at(method: VirtualPixelMethod, x: i64, y: i64) -> Source {
        resolve(method, x, y, 4, 4, &mut || 0.5)
    }

    #[test]
    fn test_edge_clamps() {
        assert_eq!(at(VirtualPixelMethod::Edge, -1, -1), Source::Pixel { x: 0, y: 0 });
        assert_eq!(at(VirtualPixelMethod::Edge, 9, 2), Source::Pixel { x: 3, y: 2 });
        assert_eq!(at(VirtualPixelMethod::Undefined, 1, 100), Source::Pixel { x: 1, y: 3 });
    }

    #[test]
    fn test_tile_and_mirror() {
        assert_eq!(at(VirtualPixelMethod::Tile, -1, 5), Source::Pixel { x: 3, y: 1 });
        assert_eq!(at(VirtualPixelMethod::Mirror, -1, 4), Source::Pixel { x: 0, y: 3 });
        assert_eq!(at(VirtualPixelMethod::Mirror, -5, 9), Source::Pixel { x: 3, y: 1 });
    }

    #[test]
    fn test_mirror_symmetry() {
        let extent = 5u64;
        for k in -3i64..=3 {
            for coord in -12i64..12 {
                let reflected = 2 * k * extent as i64 - coord - 1;
                assert_eq!(mirror(coord, extent), mirror(reflected, extent));
            }
        }
    }

    #[test]
    fn test_single_axis_tiles() {
        assert_eq!(at(VirtualPixelMethod::HorizontalTile, 5, 0), Source::Pixel { x: 1, y: 0 });
        assert_eq!(at(VirtualPixelMethod::HorizontalTile, 5, -1), Source::Constant);
        assert_eq!(at(VirtualPixelMethod::VerticalTile, 0, 6), Source::Pixel { x: 0, y: 2 });
        assert_eq!(at(VirtualPixelMethod::VerticalTile, 4, 1), Source::Constant);
        assert_eq!(
            at(VirtualPixelMethod::HorizontalTileEdge, 6, -3),
            Source::Pixel { x: 2, y: 0 }
        );
        assert_eq!(
            at(VirtualPixelMethod::VerticalTileEdge, -3, 6),
            Source::Pixel { x: 0, y: 2 }
        );
    }

    #[test]
    fn test_checker_tile() {
        assert_eq!(at(VirtualPixelMethod::CheckerTile, 4, 0), Source::Constant);
        assert_eq!(at(VirtualPixelMethod::CheckerTile, 4, 4), Source::Pixel { x: 0, y: 0 });
        assert_eq!(at(VirtualPixelMethod::CheckerTile, -1, 0), Source::Constant);
        assert_eq!(at(VirtualPixelMethod::CheckerTile, -1, -1), Source::Pixel { x: 3, y: 3 });
    }

    #[test]
    fn test_dither_stays_in_bounds() {
        for x in -100i64..100 {
            match resolve(VirtualPixelMethod::Dither, x, -x, 10, 10, &mut || 0.0) {
                Source::Pixel { x, y } => assert!(x < 10 && y < 10),
                Source::Constant => panic!("dither never yields a constant"),
            }
        }
        // x & 7 == 1 picks offset 48: 1 + 48 - 32 = 17.
        assert_eq!(dither(1, 100), 17);
    }

    #[test]
    fn test_random_is_seeded() {
        let mut a = rng();
        let mut b = rng();
        for _ in 0..32 {
            let first = resolve(VirtualPixelMethod::Random, -1, -1, 4, 4, &mut || a.gen());
            let second = resolve(VirtualPixelMethod::Random, -1, -1, 4, 4, &mut || b.gen());
            assert_eq!(first, second);
            match first {
                Source::Pixel { x, y } => assert!(x < 4 && y < 4),
                Source::Constant => panic!("random never yields a constant"),
            }
        }
        assert_eq!(
            resolve(VirtualPixelMethod::Random, 9, 9, 4, 4, &mut || 0.999_999),
            Source::Pixel { x: 3, y: 3 }
        );
    }

    #[test]
    fn test_constant_pixels() {
        let rgba = PixelMorphology::new(1, 1, 4).with_alpha_channel(3);
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Black, &rgba, None),
            vec![0, 0, 0, OPAQUE_ALPHA]
        );
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Gray, &rgba, None)[0],
            QUANTUM_RANGE / 2
        );
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Transparent, &rgba, None),
            vec![0, 0, 0, 0]
        );
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Background, &rgba, Some(&[1, 2, 3, 4])),
            vec![1, 2, 3, 4]
        );
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Mask, &rgba, Some(&[9])),
            vec![9, 0, 0, 0]
        );
        assert_eq!(
            constant_pixel(VirtualPixelMethod::Background, &rgba, None),
            vec![QUANTUM_RANGE; 4]
        );
        assert!(VirtualPixelMethod::White.is_constant());
        assert!(!VirtualPixelMethod::Tile.is_constant());
    }
}
