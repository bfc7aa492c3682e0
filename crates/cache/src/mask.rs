//! Write masks applied when a nexus is synced.

use crate::morphology::{Quantum, QUANTUM_RANGE};

/// How a mask restricts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    /// Pixels with intensity above one half take the new value, the rest keep the old one.
    Clip,
    /// New and old values are composited with the intensity as the alpha weight.
    Composite,
}

/// Per-pixel write mask for one image.
///
/// Intensities are stored row-major with `columns` entries per row. Pixels
/// without an entry are fully writable.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMask {
    kind: MaskKind,
    columns: u64,
    intensities: Vec<f32>,
}

impl PixelMask {
    pub fn new(kind: MaskKind, columns: u64, intensities: Vec<f32>) -> Self {
        let intensities = intensities
            .into_iter()
            .map(|value| if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) })
            .collect();
        Self {
            kind,
            columns,
            intensities,
        }
    }

    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    pub fn intensity(&self, x: u64, y: u64) -> f32 {
        if x >= self.columns {
            return 1.0;
        }
        y.checked_mul(self.columns)
            .and_then(|row| row.checked_add(x))
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| self.intensities.get(index).copied())
            .unwrap_or(1.0)
    }

    /// Combine a freshly written pixel with the one it replaces.
    pub(crate) fn blend(&self, x: u64, y: u64, new: &mut [Quantum], old: &[Quantum]) {
        let alpha = self.intensity(x, y);
        match self.kind {
            MaskKind::Clip => {
                if alpha <= 0.5 {
                    new.copy_from_slice(old);
                }
            }
            MaskKind::Composite => {
                for (sample, previous) in new.iter_mut().zip(old) {
                    let value = *sample as f32 * alpha + *previous as f32 * (1.0 - alpha);
                    *sample = value.round().clamp(0.0, QUANTUM_RANGE as f32) as Quantum;
                }
            }
        }
    }
}
