//! Finite-difference verification of the analytic gradients
//!
//! The objective is `L = sum(upstream * forward(image, map))`. Its analytic
//! gradients come from one backward call; the numeric ones from central
//! differences, perturbing one input element at a time. The operator is
//! D-linear, so the two agree whenever no map coordinate sits within `eps`
//! of a grid line.

use ndarray::{ArrayD, ArrayViewD, Dimension, Zip};

use crate::error::{Result, StnError};
use crate::transformer::SpatialTransformer;

/// Outcome of [`check_gradients`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckReport {
    /// Largest relative error over `grad_image`.
    pub image_error: f64,
    /// Largest relative error over `grad_map`.
    pub map_error: f64,
    /// Number of elements compared.
    pub checked: usize,
}

impl GradCheckReport {
    pub fn max_error(&self) -> f64 {
        self.image_error.max(self.map_error)
    }

    pub fn passes(&self, tolerance: f64) -> bool {
        self.max_error() < tolerance
    }
}

fn relative_error(analytic: f64, numeric: f64) -> f64 {
    (analytic - numeric).abs() / 1f64.max(analytic.abs()).max(numeric.abs())
}

fn objective(
    stn: &mut SpatialTransformer<f64>,
    image: &ArrayViewD<f64>,
    map: &ArrayViewD<f64>,
    upstream: &ArrayViewD<f64>,
) -> Result<f64> {
    let out = stn.forward(image, map)?;
    stn.reset();
    Ok(Zip::from(&out).and(upstream).fold(0.0, |acc, &o, &u| acc + o * u))
}

/// Largest relative error between `analytic` and central differences of
/// `f` over every element of `input`.
fn compare<F>(input: &ArrayD<f64>, analytic: &ArrayD<f64>, eps: f64, mut f: F) -> Result<f64>
where
    F: FnMut(&ArrayD<f64>) -> Result<f64>,
{
    let mut perturbed = input.clone();
    let mut worst = 0.0f64;
    for (idx, &a) in analytic.indexed_iter() {
        let idx = idx.slice();
        let original = perturbed[idx];
        perturbed[idx] = original + eps;
        let plus = f(&perturbed)?;
        perturbed[idx] = original - eps;
        let minus = f(&perturbed)?;
        perturbed[idx] = original;

        let numeric = (plus - minus) / (2.0 * eps);
        let err = relative_error(a, numeric);
        if err > worst {
            tracing::trace!(index = ?idx, analytic = a, numeric, "new worst element");
        }
        worst = worst.max(err);
    }
    Ok(worst)
}

/// Compare analytic and numeric gradients of `stn` at `(image, map)`.
///
/// Any pending forward of `stn` is discarded; the operator is idle afterwards.
///
/// # Errors
///
/// Propagates shape errors from the operator; [`StnError::Config`] for a
/// non-positive `eps`.
pub fn check_gradients(
    stn: &mut SpatialTransformer<f64>,
    image: &ArrayViewD<f64>,
    map: &ArrayViewD<f64>,
    upstream: &ArrayViewD<f64>,
    eps: f64,
) -> Result<GradCheckReport> {
    if !(eps.is_finite() && eps > 0.0) {
        return Err(StnError::config(format!("eps must be positive, got {eps}")));
    }
    stn.reset();
    let out = stn.forward(image, map)?;
    if out.shape() != upstream.shape() {
        stn.reset();
        return Err(StnError::shape(format!(
            "upstream gradient shape {:?} does not match output shape {:?}",
            upstream.shape(),
            out.shape()
        )));
    }
    let (grad_image, grad_map) = stn.backward(upstream)?;

    let image = image.to_owned();
    let map = map.to_owned();
    let image_error = compare(&image, &grad_image, eps, |perturbed| {
        objective(stn, &perturbed.view(), &map.view(), upstream)
    })?;
    let map_error = compare(&map, &grad_map, eps, |perturbed| {
        objective(stn, &image.view(), &perturbed.view(), upstream)
    })?;

    let report = GradCheckReport {
        image_error,
        map_error,
        checked: image.len() + map.len(),
    };
    tracing::debug!(?report, "gradient check finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ComputeCapabilities, ComputeUnit};
    use crate::transformer::OperatorState;
    use ndarray::IxDyn;

    #[test]
    fn test_relative_error_floor() {
        assert_eq!(relative_error(1e-9, 0.0), 1e-9);
        assert!((relative_error(100.0, 101.0) - 1.0 / 101.0).abs() < 1e-15);
    }

    #[test]
    fn test_1d_gradients_match() {
        let mut stn = SpatialTransformer::with_unit(
            &[0.5],
            true,
            ComputeUnit::Serial,
            &ComputeCapabilities::serial_only(),
        )
        .unwrap();
        let image = ArrayD::from_shape_vec(IxDyn(&[1, 1, 5]), vec![0.3, -1.0, 2.0, 0.5, 1.5]).unwrap();
        // index positions 0.3, 1.6, 2.4, 3.7 and -0.6 (outside)
        let map = ArrayD::from_shape_vec(IxDyn(&[1, 1, 5]), vec![0.15, 0.8, 1.2, 1.85, -0.3]).unwrap();
        let upstream = ArrayD::from_shape_vec(IxDyn(&[1, 1, 5]), vec![1.0, -0.5, 2.0, 0.7, 1.1]).unwrap();

        let report = check_gradients(&mut stn, &image.view(), &map.view(), &upstream.view(), 1e-6).unwrap();
        assert!(report.passes(1e-6), "{report:?}");
        assert_eq!(report.checked, 10);
        assert_eq!(stn.state(), OperatorState::Idle);
    }

    #[test]
    fn test_rejects_bad_eps_and_upstream() {
        let mut stn = SpatialTransformer::with_unit(
            &[1.0],
            false,
            ComputeUnit::Serial,
            &ComputeCapabilities::serial_only(),
        )
        .unwrap();
        let image = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 3]));
        let map = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 3]));
        assert!(matches!(
            check_gradients(&mut stn, &image.view(), &map.view(), &image.view(), 0.0),
            Err(StnError::Config(_))
        ));
        let upstream = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 4]));
        assert!(matches!(
            check_gradients(&mut stn, &image.view(), &map.view(), &upstream.view(), 1e-6),
            Err(StnError::Shape(_))
        ));
        assert_eq!(stn.state(), OperatorState::Idle);
    }
}
