//! Copying pixels between stores of any tier.

use crate::error::{CacheError, Result};
use crate::morphology::{PixelMorphology, Quantum};
use crate::store::CacheStore;
use crate::tier::Tier;

/// Largest staging buffer used when copying through byte ranges.
const MAX_BUFFER_EXTENT: usize = 256 * 1024;

/// A tier together with the layout of the bytes it holds.
pub(crate) struct PixelSpan<'a> {
    pub tier: &'a dyn Tier,
    pub morphology: &'a PixelMorphology,
}

/// Copy `src` into `dst`.
///
/// Identical layouts are copied as one byte range. Otherwise each row is
/// copied pixel by pixel over the overlapping columns, channels and
/// metacontent bytes, and everything else in `dst` is zeroed.
pub(crate) fn copy_span(dst: &PixelSpan<'_>, src: &PixelSpan<'_>) -> Result<()> {
    let optimized = dst.morphology.same_shape(src.morphology) && dst.tier.len() == src.tier.len();
    log::debug!(
        "clone {} => {} ({})",
        src.tier.kind(),
        dst.tier.kind(),
        if optimized { "optimized" } else { "generic" }
    );
    if optimized {
        copy_bytes(dst.tier, src.tier)
    } else {
        copy_rows(dst, src)
    }
}

fn staging<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|err| CacheError::AllocationFailed(format!("clone buffer of {} elements: {}", len, err)))?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

fn copy_bytes(dst: &dyn Tier, src: &dyn Tier) -> Result<()> {
    let len = src.len();
    if let (Some(to), Some(from)) = (dst.base(), src.base()) {
        // SAFETY: both tiers span `len` bytes and are distinct allocations.
        unsafe { std::ptr::copy_nonoverlapping(from.as_ptr(), to.as_ptr(), len as usize) };
        return Ok(());
    }
    let mut buffer = staging::<u8>((len as usize).min(MAX_BUFFER_EXTENT))?;
    let mut offset = 0u64;
    while offset < len {
        let chunk = ((len - offset) as usize).min(buffer.len());
        src.read_range(offset, &mut buffer[..chunk])?;
        dst.write_range(offset, &buffer[..chunk])?;
        offset += chunk as u64;
    }
    Ok(())
}

fn copy_rows(dst: &PixelSpan<'_>, src: &PixelSpan<'_>) -> Result<()> {
    let (d, s) = (dst.morphology, src.morphology);
    let columns = d.columns.min(s.columns) as usize;
    let channels = d.channels.min(s.channels) as usize;
    let extent = d.metacontent_extent.min(s.metacontent_extent) as usize;
    let (d_channels, s_channels) = (d.channels as usize, s.channels as usize);
    let (d_extent, s_extent) = (d.metacontent_extent as usize, s.metacontent_extent as usize);

    let mut src_row = staging::<Quantum>(s.columns as usize * s_channels)?;
    let mut dst_row = staging::<Quantum>(d.columns as usize * d_channels)?;
    let mut src_meta = staging::<u8>(s.columns as usize * s_extent)?;
    let mut dst_meta = staging::<u8>(d.columns as usize * d_extent)?;

    for y in 0..d.rows {
        dst_row.fill(0);
        dst_meta.fill(0);
        if y < s.rows {
            src.tier
                .read_range(s.pixel_offset(0, y), bytemuck::cast_slice_mut(&mut src_row))?;
            for (to, from) in dst_row
                .chunks_mut(d_channels)
                .zip(src_row.chunks(s_channels))
                .take(columns)
            {
                to[..channels].copy_from_slice(&from[..channels]);
            }
            if extent > 0 {
                src.tier.read_range(s.metacontent_offset(0, y), &mut src_meta)?;
                for (to, from) in dst_meta
                    .chunks_mut(d_extent)
                    .zip(src_meta.chunks(s_extent))
                    .take(columns)
                {
                    to[..extent].copy_from_slice(&from[..extent]);
                }
            }
        }
        dst.tier
            .write_range(d.pixel_offset(0, y), bytemuck::cast_slice(&dst_row))?;
        if d_extent > 0 {
            dst.tier.write_range(d.metacontent_offset(0, y), &dst_meta)?;
        }
    }
    Ok(())
}

/// Copy every pixel of `src` into `dst`, adapting to differing layouts.
///
/// A source without pixels (pinged) leaves `dst` untouched.
///
/// # Errors
///
/// [`CacheError::CacheNotOpen`] if either store has no tier yet, or any I/O
/// error from the tiers.
pub fn clone_pixels(dst: &CacheStore, src: &CacheStore) -> Result<()> {
    if src.is_ping() || src.tier() == crate::TierKind::Ping {
        return Ok(());
    }
    copy_span(&dst.span()?, &src.span()?)
}
