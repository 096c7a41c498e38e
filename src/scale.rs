//! Physical to normalized map coordinates
//!
//! Maps produced by a registration model hold physical coordinates: index
//! times spacing. The resampler expects every axis in `[-1, 1]`. With `m` the
//! map extent along an axis the conversion is
//!
//! ```text
//! normalized = physical * 2 / ((m - 1) * spacing) - 1
//! ```
//!
//! Axes of extent 1 pass through unchanged. Gradients with respect to the
//! normalized map are converted back with the same per-axis factor.

use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::error::{Result, StnError};
use crate::scalar::MAX_DIMS;
use crate::{cast, Element};

/// Check a spacing vector: 1 to 3 finite, strictly positive values.
pub fn validate_spacing(spacing: &[f64]) -> Result<()> {
    if spacing.is_empty() {
        return Err(StnError::config("spacing must not be empty"));
    }
    if spacing.len() > MAX_DIMS {
        return Err(StnError::config(format!(
            "only 1D, 2D and 3D are supported, got {} spacing values",
            spacing.len()
        )));
    }
    if let Some(bad) = spacing.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        return Err(StnError::config(format!(
            "spacing values must be positive, got {} in {:?}",
            bad, spacing
        )));
    }
    Ok(())
}

/// Per-axis chain-rule factor `d(normalized) / d(physical)`, `None` for
/// pass-through axes.
fn axis_factors(shape: &[usize], spacing: &[f64]) -> Result<Vec<Option<f64>>> {
    if spacing.len() + 2 != shape.len() {
        return Err(StnError::shape(format!(
            "map rank {} does not match {} spacing values (expected rank {})",
            shape.len(),
            spacing.len(),
            spacing.len() + 2
        )));
    }
    if shape[1] != spacing.len() {
        return Err(StnError::shape(format!(
            "map has {} coordinate channels, expected {}",
            shape[1],
            spacing.len()
        )));
    }

    Ok(spacing
        .iter()
        .zip(&shape[2..])
        .map(|(&s, &m)| (m > 1).then(|| 2.0 / ((m - 1) as f64 * s)))
        .collect())
}

/// Convert a physical map `(B, D, spatial...)` to normalized coordinates.
pub fn scale_map<T: Element>(map: &ArrayViewD<T>, spacing: &[f64]) -> Result<ArrayD<T>> {
    let factors = axis_factors(map.shape(), spacing)?;
    let mut scaled = map.as_standard_layout().into_owned();
    let one = T::one();
    for (d, factor) in factors.into_iter().enumerate() {
        if let Some(factor) = factor {
            let factor = cast::<T>(factor);
            scaled
                .index_axis_mut(Axis(1), d)
                .mapv_inplace(|v| v * factor - one);
        }
    }
    Ok(scaled)
}

/// Convert a gradient with respect to the normalized map into a gradient with
/// respect to the physical map, in place.
pub fn unscale_gradient<T: Element>(mut grad: ArrayD<T>, spacing: &[f64]) -> Result<ArrayD<T>> {
    let factors = axis_factors(grad.shape(), spacing)?;
    for (d, factor) in factors.into_iter().enumerate() {
        if let Some(factor) = factor {
            let factor = cast::<T>(factor);
            grad.index_axis_mut(Axis(1), d).mapv_inplace(|g| g * factor);
        }
    }
    Ok(grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    #[test]
    fn test_scale_maps_physical_extent_to_unit_range() {
        // 1D map of extent 5, spacing 0.5: physical range [0, 2]
        let map = ArrayD::from_shape_vec(IxDyn(&[1, 1, 5]), vec![0.0, 0.5, 1.0, 1.5, 2.0]).unwrap();
        let scaled = scale_map(&map.view(), &[0.5]).unwrap();
        let expected = [-1.0, -0.5, 0.0, 0.5, 1.0];
        for (s, e) in scaled.iter().zip(expected) {
            assert_relative_eq!(*s, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_scale_per_axis_factor() {
        // 2D, extents (3, 5), spacing (1, 0.25)
        let map = ArrayD::from_elem(IxDyn(&[1, 2, 3, 5]), 1.0f64);
        let scaled = scale_map(&map.view(), &[1.0, 0.25]).unwrap();
        assert_relative_eq!(scaled[[0, 0, 1, 1]], 0.0, epsilon = 1e-12);
        assert_relative_eq!(scaled[[0, 1, 1, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singleton_axis_passes_through() {
        let map = ArrayD::from_elem(IxDyn(&[1, 1, 1]), 0.3f64);
        let scaled = scale_map(&map.view(), &[0.1]).unwrap();
        assert_eq!(scaled[[0, 0, 0]], 0.3);
        let grad = unscale_gradient(ArrayD::from_elem(IxDyn(&[1, 1, 1]), 2.0f64), &[0.1]).unwrap();
        assert_eq!(grad[[0, 0, 0]], 2.0);
    }

    #[test]
    fn test_unscale_matches_scale_slope() {
        let spacing = [0.2, 0.7, 1.3];
        let map = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4, 6, 3]), |i| (i[0] + i[2] * i[3] + i[4]) as f64 * 0.1);
        let eps = 1e-3;
        let shifted = map.mapv(|v| v + eps);
        let slope = (&scale_map(&shifted.view(), &spacing).unwrap() - &scale_map(&map.view(), &spacing).unwrap())
            / eps;
        let grad = unscale_gradient(ArrayD::<f64>::ones(map.raw_dim()), &spacing).unwrap();
        for (s, g) in slope.iter().zip(grad.iter()) {
            assert_relative_eq!(*s, *g, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_rank_mismatch_is_shape_error() {
        let map = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 4, 4]));
        assert!(matches!(scale_map(&map.view(), &[1.0]), Err(StnError::Shape(_))));
        assert!(matches!(
            unscale_gradient(map, &[1.0, 1.0, 1.0]),
            Err(StnError::Shape(_))
        ));
    }

    #[test]
    fn test_validate_spacing() {
        assert!(validate_spacing(&[1.0, 0.5]).is_ok());
        assert!(matches!(validate_spacing(&[]), Err(StnError::Config(_))));
        assert!(matches!(validate_spacing(&[1.0, 0.0]), Err(StnError::Config(_))));
        assert!(matches!(validate_spacing(&[-1.0]), Err(StnError::Config(_))));
        assert!(matches!(validate_spacing(&[f64::NAN]), Err(StnError::Config(_))));
        assert!(matches!(validate_spacing(&[1.0; 4]), Err(StnError::Config(_))));
    }
}
