//! Single-threaded backend.

use super::{Backend, ComputeUnit};
use crate::scalar::{self, Geometry};
use crate::{BoundaryPolicy, Element};

/// Runs the scalar reference loops on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl<T: Element> Backend<T> for SerialBackend {
    fn unit(&self) -> ComputeUnit {
        ComputeUnit::Serial
    }

    fn resample(
        &self,
        geom: &Geometry,
        image: &[T],
        map: &[T],
        boundary: BoundaryPolicy,
        output: &mut [T],
    ) {
        scalar::resample_serial(geom, image, map, boundary, output);
    }

    fn resample_grad(
        &self,
        geom: &Geometry,
        image: &[T],
        map: &[T],
        grad_output: &[T],
        boundary: BoundaryPolicy,
        grad_image: &mut [T],
        grad_map: &mut [T],
    ) {
        scalar::resample_grad_serial(geom, image, map, grad_output, boundary, grad_image, grad_map);
    }
}
