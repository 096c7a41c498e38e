//! Coordinate grid utilities
//!
//! Helpers a registration driver needs around the transformer: identity maps
//! in physical and normalized coordinates, displacement fields, map
//! composition and resizing for multi-scale pyramids.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::error::{Result, StnError};
use crate::scalar::MAX_DIMS;
use crate::scale::validate_spacing;
use crate::{cast, warp, BoundaryPolicy, Element};

fn check_extent(extent: &[usize]) -> Result<()> {
    if extent.is_empty() || extent.len() > MAX_DIMS {
        return Err(StnError::shape(format!(
            "spatial extent must have 1 to 3 axes, got {:?}",
            extent
        )));
    }
    if extent.contains(&0) {
        return Err(StnError::shape(format!(
            "spatial extents must be positive, got {:?}",
            extent
        )));
    }
    Ok(())
}

fn map_shape(batch: usize, extent: &[usize]) -> IxDyn {
    let mut shape = Vec::with_capacity(extent.len() + 2);
    shape.push(batch);
    shape.push(extent.len());
    shape.extend_from_slice(extent);
    IxDyn(&shape)
}

/// Identity map `(batch, D, extent...)` in physical coordinates: channel `d`
/// holds `index_d * spacing_d`.
pub fn identity_map_batch<T: Element>(
    batch: usize,
    extent: &[usize],
    spacing: &[f64],
) -> Result<ArrayD<T>> {
    check_extent(extent)?;
    validate_spacing(spacing)?;
    if extent.len() != spacing.len() {
        return Err(StnError::shape(format!(
            "{} spatial axes but {} spacing values",
            extent.len(),
            spacing.len()
        )));
    }
    if batch == 0 {
        return Err(StnError::shape("batch size must be positive"));
    }

    Ok(ArrayD::from_shape_fn(map_shape(batch, extent), |idx| {
        let d = idx[1];
        cast(idx[2 + d] as f64 * spacing[d])
    }))
}

/// Identity map with batch size 1.
#[inline]
pub fn identity_map<T: Element>(extent: &[usize], spacing: &[f64]) -> Result<ArrayD<T>> {
    identity_map_batch(1, extent, spacing)
}

/// Identity grid `(1, D, extent...)` in normalized `[-1, 1]` coordinates.
///
/// Axes of extent 1 hold 0, the coordinate that addresses their only voxel.
pub fn normalized_identity_grid<T: Element>(extent: &[usize]) -> Result<ArrayD<T>> {
    check_extent(extent)?;
    Ok(ArrayD::from_shape_fn(map_shape(1, extent), |idx| {
        let d = idx[1];
        let n = extent[d];
        if n > 1 {
            cast(2.0 * idx[2 + d] as f64 / (n - 1) as f64 - 1.0)
        } else {
            T::zero()
        }
    }))
}

/// Add a displacement field `(B, D, spatial...)` to the identity map of its
/// own grid.
pub fn displacement_to_map<T: Element>(
    displacement: &ArrayViewD<T>,
    spacing: &[f64],
) -> Result<ArrayD<T>> {
    let shape = displacement.shape();
    if shape.len() != spacing.len() + 2 || shape[1] != spacing.len() {
        return Err(StnError::shape(format!(
            "displacement of shape {:?} does not match {} spacing values",
            shape,
            spacing.len()
        )));
    }

    let identity = identity_map::<T>(&shape[2..], spacing)?;
    let mut map = displacement.to_owned();
    for mut lane in map.axis_iter_mut(Axis(0)) {
        lane += &identity.index_axis(Axis(0), 0);
    }
    Ok(map)
}

/// Compose two physical maps: the result sends `x` to `inner(outer(x))`.
///
/// `inner` is sampled as a `D`-channel image at the coordinates of `outer`
/// with the border policy. Both maps must live on the same grid.
pub fn compose_maps<T: Element>(
    inner: &ArrayViewD<T>,
    outer: &ArrayViewD<T>,
    spacing: &[f64],
) -> Result<ArrayD<T>> {
    if inner.shape() != outer.shape() {
        return Err(StnError::shape(format!(
            "composed maps must share a grid, got {:?} and {:?}",
            inner.shape(),
            outer.shape()
        )));
    }
    warp(inner, outer, spacing, BoundaryPolicy::Border)
}

/// Resample an image or field `(B, C, spatial...)` onto a grid of `extent`
/// covering the same physical domain.
///
/// # Returns
///
/// The resized array and its spacing, `spacing_d * (n_d - 1) / (m_d - 1)`
/// for old extent `n_d` and new extent `m_d` (unchanged if either is 1).
pub fn resample_to_size<T: Element>(
    image: &ArrayViewD<T>,
    spacing: &[f64],
    extent: &[usize],
) -> Result<(ArrayD<T>, Vec<f64>)> {
    validate_spacing(spacing)?;
    check_extent(extent)?;
    let shape = image.shape();
    if shape.len() != extent.len() + 2 || spacing.len() != extent.len() {
        return Err(StnError::shape(format!(
            "image of shape {:?} cannot be resized to {:?} with {} spacing values",
            shape,
            extent,
            spacing.len()
        )));
    }

    let new_spacing = spacing
        .iter()
        .zip(&shape[2..])
        .zip(extent)
        .map(|((&s, &n), &m)| {
            if n > 1 && m > 1 {
                s * (n - 1) as f64 / (m - 1) as f64
            } else {
                s
            }
        })
        .collect::<Vec<_>>();

    let grid = normalized_identity_grid::<T>(extent)?;
    let grid = grid
        .broadcast(map_shape(shape[0], extent))
        .ok_or_else(|| StnError::shape("cannot broadcast identity grid to batch"))?;
    let resized = crate::resample(image, &grid, BoundaryPolicy::Border)?;

    tracing::debug!(from = ?&shape[2..], to = ?extent, "resampled to new size");
    Ok((resized, new_spacing))
}
