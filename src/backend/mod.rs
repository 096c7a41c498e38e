//! Compute backends
//!
//! A backend runs the kernels from [`crate::scalar`] over all output
//! locations. Which one runs is decided by an explicit [`ComputeUnit`]
//! checked against [`ComputeCapabilities`]; nothing is read from process-wide
//! state at call time.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StnError};
use crate::scalar::Geometry;
use crate::{BoundaryPolicy, Element};

pub mod serial;

#[cfg(feature = "parallel")]
pub mod threaded;

pub use serial::SerialBackend;
#[cfg(feature = "parallel")]
pub use threaded::ThreadedBackend;

/// Where a forward/backward pair executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ComputeUnit {
    /// Single-threaded reference loops.
    Serial,
    /// Dedicated rayon thread pool.
    Threaded { threads: usize },
}

impl fmt::Display for ComputeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeUnit::Serial => write!(f, "serial"),
            ComputeUnit::Threaded { threads } => write!(f, "threaded({threads})"),
        }
    }
}

/// What the current build and machine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCapabilities {
    /// Threaded backend compiled in (`parallel` feature).
    pub threaded: bool,
    /// Upper bound on worker threads.
    pub max_threads: usize,
}

impl ComputeCapabilities {
    /// Probe the build features and the available hardware parallelism.
    pub fn detect() -> Self {
        let max_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            threaded: cfg!(feature = "parallel"),
            max_threads,
        }
    }

    /// Capabilities that only allow the serial backend.
    pub fn serial_only() -> Self {
        Self {
            threaded: false,
            max_threads: 1,
        }
    }

    pub fn supports(&self, unit: ComputeUnit) -> bool {
        match unit {
            ComputeUnit::Serial => true,
            ComputeUnit::Threaded { threads } => {
                self.threaded && threads >= 1 && threads <= self.max_threads
            }
        }
    }

    /// Threaded with every available thread when possible, serial otherwise.
    pub fn preferred_unit(&self) -> ComputeUnit {
        if self.threaded && self.max_threads > 1 {
            ComputeUnit::Threaded {
                threads: self.max_threads,
            }
        } else {
            ComputeUnit::Serial
        }
    }
}

impl Default for ComputeCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// A compute backend for the resampling kernels.
///
/// Slices are contiguous row-major buffers laid out as described in
/// [`crate::scalar`]; shapes have already been validated into `geom`.
pub trait Backend<T: Element>: Send + Sync + fmt::Debug {
    /// The unit this backend executes on.
    fn unit(&self) -> ComputeUnit;

    /// Write the warped image into `output`.
    fn resample(
        &self,
        geom: &Geometry,
        image: &[T],
        map: &[T],
        boundary: BoundaryPolicy,
        output: &mut [T],
    );

    /// Accumulate into `grad_image` (zero-initialised by the caller) and
    /// overwrite `grad_map`, both with respect to the normalized map.
    #[allow(clippy::too_many_arguments)]
    fn resample_grad(
        &self,
        geom: &Geometry,
        image: &[T],
        map: &[T],
        grad_output: &[T],
        boundary: BoundaryPolicy,
        grad_image: &mut [T],
        grad_map: &mut [T],
    );
}

/// Build the backend for `unit`, failing if `caps` does not allow it.
pub fn select<T: Element>(
    unit: ComputeUnit,
    caps: &ComputeCapabilities,
) -> Result<Arc<dyn Backend<T>>> {
    if !caps.supports(unit) {
        return Err(StnError::compute(format!(
            "compute unit {} is not available (threaded: {}, max threads: {})",
            unit, caps.threaded, caps.max_threads
        )));
    }

    let backend: Arc<dyn Backend<T>> = match unit {
        ComputeUnit::Serial => Arc::new(SerialBackend),
        #[cfg(feature = "parallel")]
        ComputeUnit::Threaded { threads } => Arc::new(ThreadedBackend::new(threads)?),
        #[cfg(not(feature = "parallel"))]
        ComputeUnit::Threaded { .. } => {
            return Err(StnError::compute(
                "threaded backend not compiled in (enable the `parallel` feature)",
            ))
        }
    };
    tracing::info!(unit = %unit, "compute backend selected");
    Ok(backend)
}
