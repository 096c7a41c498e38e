//! Differentiable N-dimensional spatial transformer
//!
//! This crate provides the resampling primitive at the core of map-based
//! deformable image registration: given an image `(B, C, X[, Y[, Z]])` and a
//! dense coordinate map `(B, D, X'[, Y'[, Z']])` it produces the warped image
//! by linear interpolation (linear, bilinear or trilinear), and it propagates
//! gradients back to both the image and the map.
//!
//! # Features
//!
//! - **1D, 2D and 3D** through one kernel parameterised by the spatial rank
//! - **Border or zero boundary policy**, applied identically in both passes
//! - **Analytic gradients** for image and map, checked against finite differences
//! - **Parallel execution**: rayon thread-pool backend (`parallel` feature)
//! - **ndarray integration**: works on `ArrayD` views of any layout
//!
//! # Example
//!
//! ```rust
//! use ndarray::{ArrayD, IxDyn};
//! use stn_nd::{grid, ComputeCapabilities, SpatialTransformer};
//!
//! let spacing = [0.25, 0.25];
//! let image = ArrayD::<f64>::from_shape_fn(IxDyn(&[1, 1, 5, 5]), |i| (i[2] * 5 + i[3]) as f64);
//! let map = grid::identity_map::<f64>(&[5, 5], &spacing).unwrap();
//!
//! let caps = ComputeCapabilities::detect();
//! let mut stn = SpatialTransformer::new(&spacing, false, &caps).unwrap();
//! let warped = stn.forward(&image.view(), &map.view()).unwrap();
//! assert!((warped[[0, 0, 2, 3]] - 13.0).abs() < 1e-12);
//!
//! let (grad_image, grad_map) = stn.backward(&ArrayD::ones(warped.raw_dim()).view()).unwrap();
//! assert_eq!(grad_image.shape(), image.shape());
//! assert_eq!(grad_map.shape(), map.shape());
//! ```

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD};
use num_traits::{Float, NumCast};
use serde::{Deserialize, Serialize};

pub mod backend;
pub mod config;
pub mod error;
pub mod gradcheck;
pub mod grid;
pub mod scalar;
pub mod scale;
pub mod transformer;

#[cfg(feature = "python")]
mod python;

pub use backend::{Backend, ComputeCapabilities, ComputeUnit, SerialBackend};
#[cfg(feature = "parallel")]
pub use backend::ThreadedBackend;
pub use config::{DeviceRequest, TransformerConfig};
pub use error::{Result, StnError};
pub use half::f16;
pub use transformer::{Differentiable, ExecutionContext, OperatorState, SpatialTransformer};

use scalar::Geometry;

/// Floating point element type of images, maps and gradients.
///
/// Implemented for `f32`, `f64` and [`f16`]. Interpolation weights and
/// derivatives are evaluated in the element type itself.
pub trait Element: Float + AddAssign + Default + fmt::Debug + Send + Sync + 'static {}

impl<T> Element for T where T: Float + AddAssign + Default + fmt::Debug + Send + Sync + 'static {}

/// Convert an `f64` constant into the element type.
#[inline]
pub(crate) fn cast<T: Element>(v: f64) -> T {
    <T as NumCast>::from(v).unwrap_or_else(T::nan)
}

/// How samples outside the image are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Clamp every interpolation corner to the nearest border voxel.
    #[default]
    Border,
    /// Corners outside the image contribute zero (and receive no gradient).
    Zero,
}

impl BoundaryPolicy {
    /// Policy for the registration-style `zero_boundary` flag.
    #[inline]
    pub fn from_zero_boundary(zero_boundary: bool) -> Self {
        if zero_boundary {
            BoundaryPolicy::Zero
        } else {
            BoundaryPolicy::Border
        }
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == BoundaryPolicy::Zero
    }
}

pub(crate) fn contiguous<T>(array: &ArrayD<T>) -> Result<&[T]> {
    array
        .as_slice()
        .ok_or_else(|| StnError::shape("array is not in standard layout"))
}

pub(crate) fn contiguous_mut<T>(array: &mut ArrayD<T>) -> Result<&mut [T]> {
    array
        .as_slice_mut()
        .ok_or_else(|| StnError::shape("array is not in standard layout"))
}

/// Backend used by the one-shot functions below.
///
/// Threaded on rayon's global pool when the `parallel` feature is enabled,
/// serial otherwise.
pub fn default_backend<T: Element>() -> Arc<dyn Backend<T>> {
    #[cfg(feature = "parallel")]
    {
        Arc::new(ThreadedBackend::global())
    }

    #[cfg(not(feature = "parallel"))]
    {
        Arc::new(SerialBackend)
    }
}

/// Resample `image` at a map in normalized `[-1, 1]` coordinates on `backend`.
///
/// # Returns
///
/// Warped image `(B, C, spatial'...)`: channels from the image, spatial
/// extent from the map.
pub fn resample_with<T: Element>(
    backend: &dyn Backend<T>,
    image: &ArrayViewD<T>,
    normalized_map: &ArrayViewD<T>,
    boundary: BoundaryPolicy,
) -> Result<ArrayD<T>> {
    let geom = Geometry::new(image.shape(), normalized_map.shape())?;
    let image = image.as_standard_layout().into_owned();
    let map = normalized_map.as_standard_layout().into_owned();

    let mut output = ArrayD::zeros(geom.output_shape());
    backend.resample(
        &geom,
        contiguous(&image)?,
        contiguous(&map)?,
        boundary,
        contiguous_mut(&mut output)?,
    );
    Ok(output)
}

/// Gradients of [`resample_with`] for an upstream gradient `grad_output`.
///
/// # Returns
///
/// `(grad_image, grad_map)`; `grad_map` is with respect to the normalized map.
pub fn resample_grad_with<T: Element>(
    backend: &dyn Backend<T>,
    image: &ArrayViewD<T>,
    normalized_map: &ArrayViewD<T>,
    grad_output: &ArrayViewD<T>,
    boundary: BoundaryPolicy,
) -> Result<(ArrayD<T>, ArrayD<T>)> {
    let geom = Geometry::new(image.shape(), normalized_map.shape())?;
    geom.check_grad_output(grad_output.shape())?;
    let image = image.as_standard_layout().into_owned();
    let map = normalized_map.as_standard_layout().into_owned();
    let grad_output = grad_output.as_standard_layout().into_owned();

    let mut grad_image = ArrayD::zeros(image.raw_dim());
    let mut grad_map = ArrayD::zeros(map.raw_dim());
    backend.resample_grad(
        &geom,
        contiguous(&image)?,
        contiguous(&map)?,
        contiguous(&grad_output)?,
        boundary,
        contiguous_mut(&mut grad_image)?,
        contiguous_mut(&mut grad_map)?,
    );
    Ok((grad_image, grad_map))
}

/// Resample with a normalized map on the default backend.
#[inline]
pub fn resample<T: Element>(
    image: &ArrayViewD<T>,
    normalized_map: &ArrayViewD<T>,
    boundary: BoundaryPolicy,
) -> Result<ArrayD<T>> {
    resample_with(default_backend::<T>().as_ref(), image, normalized_map, boundary)
}

/// Gradients of [`resample`] on the default backend.
#[inline]
pub fn resample_grad<T: Element>(
    image: &ArrayViewD<T>,
    normalized_map: &ArrayViewD<T>,
    grad_output: &ArrayViewD<T>,
    boundary: BoundaryPolicy,
) -> Result<(ArrayD<T>, ArrayD<T>)> {
    resample_grad_with(
        default_backend::<T>().as_ref(),
        image,
        normalized_map,
        grad_output,
        boundary,
    )
}

/// Warp `image` with a map in physical coordinates, without recording
/// anything for a backward pass.
///
/// # Arguments
///
/// * `image` - Image `(B, C, spatial...)`
/// * `map` - Physical coordinate map `(B, D, spatial'...)`
/// * `spacing` - Map spacing, one positive value per spatial axis
/// * `boundary` - Out-of-range policy
pub fn warp<T: Element>(
    image: &ArrayViewD<T>,
    map: &ArrayViewD<T>,
    spacing: &[f64],
    boundary: BoundaryPolicy,
) -> Result<ArrayD<T>> {
    scale::validate_spacing(spacing)?;
    let normalized = scale::scale_map(map, spacing)?;
    resample(image, &normalized.view(), boundary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array, IxDyn};

    #[test]
    fn test_identity_resample_f32() {
        let image = Array::from_shape_fn(IxDyn(&[1, 2, 6, 7]), |i| (i[1] * 100 + i[2] * 10 + i[3]) as f32);
        let map = grid::normalized_identity_grid::<f32>(&[6, 7]).unwrap();

        let output = resample(&image.view(), &map.view(), BoundaryPolicy::Border).unwrap();
        assert_eq!(output.shape(), image.shape());
        for (o, i) in output.iter().zip(image.iter()) {
            assert_relative_eq!(*o, *i, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_identity_resample_f16() {
        let image = Array::from_shape_fn(IxDyn(&[1, 1, 5]), |i| f16::from_f32(i[2] as f32));
        let map = grid::normalized_identity_grid::<f16>(&[5]).unwrap();

        let output = resample(&image.view(), &map.view(), BoundaryPolicy::Zero).unwrap();
        for (o, i) in output.iter().zip(image.iter()) {
            assert!((o.to_f32() - i.to_f32()).abs() < 1e-2);
        }
    }

    #[test]
    fn test_warp_rejects_bad_spacing() {
        let image = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4]));
        let map = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4]));
        let err = warp(&image.view(), &map.view(), &[0.0], BoundaryPolicy::Border).unwrap_err();
        assert!(matches!(err, StnError::Config(_)));
    }

    #[test]
    fn test_resample_grad_checks_upstream_shape() {
        let image = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4, 4]));
        let map = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 3, 3]));
        let upstream = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4, 4]));
        let err = resample_grad(&image.view(), &map.view(), &upstream.view(), BoundaryPolicy::Border)
            .unwrap_err();
        assert!(matches!(err, StnError::Shape(_)));
    }

    #[test]
    fn test_boundary_policy_from_flag() {
        assert_eq!(BoundaryPolicy::from_zero_boundary(true), BoundaryPolicy::Zero);
        assert_eq!(BoundaryPolicy::from_zero_boundary(false), BoundaryPolicy::Border);
        assert!(!BoundaryPolicy::default().is_zero());
    }
}
