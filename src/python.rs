//! Python bindings using PyO3
//!
//! Arrays are exchanged as float64 numpy arrays; the driver side is expected
//! to wrap `forward`/`backward` in its autograd framework.

use numpy::{IntoPyArray, PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::backend::ComputeCapabilities;
use crate::config::{DeviceRequest, TransformerConfig};
use crate::error::StnError;
use crate::grid;
use crate::transformer::{OperatorState, SpatialTransformer};

impl From<StnError> for PyErr {
    fn from(err: StnError) -> PyErr {
        match err {
            StnError::Config(_) | StnError::Shape(_) => PyValueError::new_err(err.to_string()),
            StnError::State(_) | StnError::Compute(_) => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// Differentiable spatial transformer over float64 arrays
///
/// Args:
///     spacing: Map spacing, one positive value per spatial axis (1 to 3)
///     zero_boundary: Treat samples outside the image as zero instead of
///         clamping to the border (default: False)
///     threads: Worker threads. If None, uses every available core.
#[pyclass(name = "SpatialTransformer")]
struct PySpatialTransformer {
    inner: SpatialTransformer<f64>,
}

#[pymethods]
impl PySpatialTransformer {
    #[new]
    #[pyo3(signature = (spacing, zero_boundary=false, threads=None))]
    fn new(spacing: Vec<f64>, zero_boundary: bool, threads: Option<usize>) -> PyResult<Self> {
        let config = TransformerConfig {
            spacing,
            zero_boundary,
            device: if threads.is_some() {
                DeviceRequest::Threaded
            } else {
                DeviceRequest::Auto
            },
            threads,
        };
        let inner = SpatialTransformer::from_config(&config, &ComputeCapabilities::detect())?;
        Ok(Self { inner })
    }

    /// Warp image (B, C, spatial...) with the physical map (B, D, spatial'...)
    fn forward<'py>(
        &mut self,
        py: Python<'py>,
        image: PyReadonlyArrayDyn<'py, f64>,
        map: PyReadonlyArrayDyn<'py, f64>,
    ) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
        let image = image.as_array();
        let map = map.as_array();
        let inner = &mut self.inner;
        let warped = py.allow_threads(|| inner.forward(&image, &map))?;
        Ok(warped.into_pyarray(py))
    }

    /// Gradients (grad_image, grad_map) of the pending forward call
    fn backward<'py>(
        &mut self,
        py: Python<'py>,
        grad_output: PyReadonlyArrayDyn<'py, f64>,
    ) -> PyResult<(Bound<'py, PyArrayDyn<f64>>, Bound<'py, PyArrayDyn<f64>>)> {
        let grad_output = grad_output.as_array();
        let inner = &mut self.inner;
        let (grad_image, grad_map) = py.allow_threads(|| inner.backward(&grad_output))?;
        Ok((grad_image.into_pyarray(py), grad_map.into_pyarray(py)))
    }

    /// Discard saved operands of an unfinished forward call
    fn reset(&mut self) {
        self.inner.reset();
    }

    /// "idle" or "forward_computed"
    #[getter]
    fn state(&self) -> &'static str {
        match self.inner.state() {
            OperatorState::Idle => "idle",
            OperatorState::ForwardComputed => "forward_computed",
        }
    }

    #[getter]
    fn spacing(&self) -> Vec<f64> {
        self.inner.spacing().to_vec()
    }

    #[getter]
    fn unit(&self) -> String {
        self.inner.unit().to_string()
    }
}

/// Identity map (batch, D, extent...) in physical coordinates
#[pyfunction]
#[pyo3(signature = (extent, spacing, batch=1))]
fn identity_map<'py>(
    py: Python<'py>,
    extent: Vec<usize>,
    spacing: Vec<f64>,
    batch: usize,
) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
    let map = grid::identity_map_batch::<f64>(batch, &extent, &spacing)?;
    Ok(map.into_pyarray(py))
}

/// Get build and runtime information
///
/// Returns a dictionary with:
/// - version: Package version
/// - parallel: Whether the threaded backend is compiled in
/// - max_threads: Available worker threads
/// - preferred_unit: Compute unit chosen when none is requested
#[pyfunction]
fn build_info(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let caps = ComputeCapabilities::detect();
    let info = PyDict::new(py);
    info.set_item("version", env!("CARGO_PKG_VERSION"))?;
    info.set_item("parallel", caps.threaded)?;
    info.set_item("max_threads", caps.max_threads)?;
    info.set_item("preferred_unit", caps.preferred_unit().to_string())?;
    Ok(info)
}

/// Differentiable N-D spatial transformer for image registration
#[pymodule]
fn stn_nd(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySpatialTransformer>()?;
    m.add_function(wrap_pyfunction!(identity_map, m)?)?;
    m.add_function(wrap_pyfunction!(build_info, m)?)?;
    Ok(())
}
