//! Scalar D-linear sampling kernels
//!
//! Every backend is built from the per-location pieces in this module: a
//! [`Stencil`] resolves the `2^D` grid corners around one sample position
//! together with their weights and weight derivatives, and the serial loops
//! at the bottom double as the reference implementation for testing.
//!
//! Flat layouts (row-major, standard ndarray order):
//! - image `(B, C, X[, Y[, Z]])`: `image[(b * C + c) * in_plane + s]`
//! - map `(B, D, X'[, Y'[, Z']])`: `map[(b * D + d) * out_plane + t]`
//! - output `(B, C, X'[, Y'[, Z']])`: `out[(b * C + c) * out_plane + t]`

use crate::error::{Result, StnError};
use crate::{cast, BoundaryPolicy, Element};

/// Largest supported spatial rank.
pub const MAX_DIMS: usize = 3;

/// Largest number of interpolation corners (`2^MAX_DIMS`).
pub const MAX_CORNERS: usize = 1 << MAX_DIMS;

/// Validated shape bookkeeping shared by forward and backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub ndim: usize,
    pub batch: usize,
    pub channels: usize,
    pub in_extent: [usize; MAX_DIMS],
    pub in_strides: [usize; MAX_DIMS],
    pub in_plane: usize,
    pub out_extent: [usize; MAX_DIMS],
    pub out_plane: usize,
}

impl Geometry {
    /// Validate an image/map shape pair.
    ///
    /// The image is `(B, C, spatial...)`, the map `(B, D, spatial'...)` with
    /// `D` equal to the spatial rank of the image.
    pub fn new(image_shape: &[usize], map_shape: &[usize]) -> Result<Self> {
        let rank = image_shape.len();
        if !(3..=MAX_DIMS + 2).contains(&rank) {
            return Err(StnError::shape(format!(
                "image must have rank 3, 4 or 5 (B, C, spatial...), got shape {:?}",
                image_shape
            )));
        }
        if map_shape.len() != rank {
            return Err(StnError::shape(format!(
                "map rank {} does not match image rank {} (image {:?}, map {:?})",
                map_shape.len(),
                rank,
                image_shape,
                map_shape
            )));
        }

        let ndim = rank - 2;
        if map_shape[1] != ndim {
            return Err(StnError::shape(format!(
                "map must carry {} coordinate channels for a {}D image, got {}",
                ndim, ndim, map_shape[1]
            )));
        }
        if map_shape[0] != image_shape[0] {
            return Err(StnError::shape(format!(
                "batch size mismatch: image {} vs map {}",
                image_shape[0], map_shape[0]
            )));
        }
        if image_shape[2..].iter().chain(&map_shape[2..]).any(|&n| n == 0) {
            return Err(StnError::shape(format!(
                "spatial extents must be positive (image {:?}, map {:?})",
                image_shape, map_shape
            )));
        }

        let mut in_extent = [1; MAX_DIMS];
        let mut out_extent = [1; MAX_DIMS];
        in_extent[..ndim].copy_from_slice(&image_shape[2..]);
        out_extent[..ndim].copy_from_slice(&map_shape[2..]);

        let mut in_strides = [0; MAX_DIMS];
        let mut stride = 1;
        for d in (0..ndim).rev() {
            in_strides[d] = stride;
            stride *= in_extent[d];
        }

        Ok(Self {
            ndim,
            batch: image_shape[0],
            channels: image_shape[1],
            in_extent,
            in_strides,
            in_plane: stride,
            out_extent,
            out_plane: out_extent[..ndim].iter().product(),
        })
    }

    /// `(B, C, spatial...)` of the image.
    pub fn image_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.batch, self.channels];
        shape.extend_from_slice(&self.in_extent[..self.ndim]);
        shape
    }

    /// `(B, D, spatial'...)` of the map.
    pub fn map_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.batch, self.ndim];
        shape.extend_from_slice(&self.out_extent[..self.ndim]);
        shape
    }

    /// `(B, C, spatial'...)`: channels from the image, extent from the map.
    pub fn output_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.batch, self.channels];
        shape.extend_from_slice(&self.out_extent[..self.ndim]);
        shape
    }

    /// Check that an upstream gradient matches the output of this geometry.
    pub fn check_grad_output(&self, shape: &[usize]) -> Result<()> {
        let expected = self.output_shape();
        if shape != expected.as_slice() {
            return Err(StnError::shape(format!(
                "grad_output shape {:?} does not match output shape {:?}",
                shape, expected
            )));
        }
        Ok(())
    }

    /// Normalized coordinates of output location `t` in batch `b`.
    #[inline]
    pub fn coords_at<T: Element>(&self, map: &[T], b: usize, t: usize) -> [T; MAX_DIMS] {
        let mut coords = [T::zero(); MAX_DIMS];
        for (d, c) in coords.iter_mut().enumerate().take(self.ndim) {
            *c = map[(b * self.ndim + d) * self.out_plane + t];
        }
        coords
    }

    #[inline]
    pub fn image_plane<'a, T>(&self, image: &'a [T], bc: usize) -> &'a [T] {
        &image[bc * self.in_plane..(bc + 1) * self.in_plane]
    }
}

/// The in-range corners around one sample position.
///
/// Weights are products of per-axis linear weights `1 - f` and `f`. `slopes`
/// hold the derivative of each corner weight with respect to the index-space
/// coordinate of every axis, `scale` the derivative of the index-space
/// coordinate with respect to the normalized one.
#[derive(Debug, Clone, Copy)]
pub struct Stencil<T> {
    ndim: usize,
    len: usize,
    offsets: [usize; MAX_CORNERS],
    weights: [T; MAX_CORNERS],
    slopes: [[T; MAX_DIMS]; MAX_CORNERS],
    scale: [T; MAX_DIMS],
}

impl<T: Element> Stencil<T> {
    /// Resolve the stencil for normalized coordinates in `[-1, 1]`.
    ///
    /// Border policy clamps corner indices into the image, zero policy drops
    /// the corners that fall outside.
    pub fn at(geom: &Geometry, coords: &[T; MAX_DIMS], boundary: BoundaryPolicy) -> Self {
        let one = T::one();
        let half = cast::<T>(0.5);
        let ndim = geom.ndim;

        let mut scale = [T::zero(); MAX_DIMS];
        let mut base = [0isize; MAX_DIMS];
        let mut frac = [T::zero(); MAX_DIMS];
        for d in 0..ndim {
            let n = geom.in_extent[d];
            scale[d] = cast::<T>((n - 1) as f64) * half;
            // Positions further than one voxel outside behave identically
            // under both policies; clamping keeps the floor representable.
            let p = ((coords[d] + one) * scale[d])
                .max(cast(-2.0))
                .min(cast((n + 1) as f64));
            let p0 = p.floor();
            base[d] = p0.to_isize().unwrap_or(-2);
            frac[d] = p - p0;
        }

        let mut stencil = Self {
            ndim,
            len: 0,
            offsets: [0; MAX_CORNERS],
            weights: [T::zero(); MAX_CORNERS],
            slopes: [[T::zero(); MAX_DIMS]; MAX_CORNERS],
            scale,
        };

        'corners: for corner in 0..(1usize << ndim) {
            let mut offset = 0;
            let mut axis_w = [one; MAX_DIMS];
            let mut axis_dw = [T::zero(); MAX_DIMS];
            for d in 0..ndim {
                let upper = (corner >> d) & 1 == 1;
                let n = geom.in_extent[d] as isize;
                let idx = base[d] + upper as isize;
                let idx = match boundary {
                    BoundaryPolicy::Border => idx.clamp(0, n - 1),
                    BoundaryPolicy::Zero if idx < 0 || idx >= n => continue 'corners,
                    BoundaryPolicy::Zero => idx,
                };
                offset += idx as usize * geom.in_strides[d];
                if upper {
                    axis_w[d] = frac[d];
                    axis_dw[d] = one;
                } else {
                    axis_w[d] = one - frac[d];
                    axis_dw[d] = -one;
                }
            }

            let k = stencil.len;
            stencil.offsets[k] = offset;
            stencil.weights[k] = axis_w[..ndim].iter().fold(one, |acc, &w| acc * w);
            for d in 0..ndim {
                stencil.slopes[k][d] = (0..ndim).fold(one, |acc, e| {
                    acc * if e == d { axis_dw[e] } else { axis_w[e] }
                });
            }
            stencil.len += 1;
        }

        stencil
    }

    /// Number of corners that contribute (`2^D` unless dropped by zero policy).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Contributing corners as `(flat spatial offset, weight)`.
    pub fn corners(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        self.offsets[..self.len]
            .iter()
            .copied()
            .zip(self.weights[..self.len].iter().copied())
    }

    /// Interpolated value from one `(b, c)` image plane.
    #[inline]
    pub fn sample(&self, plane: &[T]) -> T {
        let mut acc = T::zero();
        for k in 0..self.len {
            acc += self.weights[k] * plane[self.offsets[k]];
        }
        acc
    }

    /// Scatter `grad * weight` into every contributing corner.
    #[inline]
    pub fn scatter(&self, plane: &mut [T], grad: T) {
        for k in 0..self.len {
            plane[self.offsets[k]] += self.weights[k] * grad;
        }
    }

    /// Accumulate `grad * d(sample)/d(normalized coordinate)` per axis.
    #[inline]
    pub fn accumulate_coordinate_grad(&self, plane: &[T], grad: T, out: &mut [T; MAX_DIMS]) {
        for d in 0..self.ndim {
            let mut slope = T::zero();
            for k in 0..self.len {
                slope += self.slopes[k][d] * plane[self.offsets[k]];
            }
            out[d] += grad * slope * self.scale[d];
        }
    }
}

/// Map gradient at output location `t` of batch `b`, summed over channels.
#[inline]
pub fn coordinate_grad_at<T: Element>(
    geom: &Geometry,
    image: &[T],
    map: &[T],
    grad_output: &[T],
    boundary: BoundaryPolicy,
    b: usize,
    t: usize,
) -> [T; MAX_DIMS] {
    let stencil = Stencil::at(geom, &geom.coords_at(map, b, t), boundary);
    let mut acc = [T::zero(); MAX_DIMS];
    for c in 0..geom.channels {
        let bc = b * geom.channels + c;
        let g = grad_output[bc * geom.out_plane + t];
        stencil.accumulate_coordinate_grad(geom.image_plane(image, bc), g, &mut acc);
    }
    acc
}

/// Serial forward resampling.
///
/// `output` must hold `B * C * out_plane` elements.
pub fn resample_serial<T: Element>(
    geom: &Geometry,
    image: &[T],
    map: &[T],
    boundary: BoundaryPolicy,
    output: &mut [T],
) {
    for b in 0..geom.batch {
        for t in 0..geom.out_plane {
            let stencil = Stencil::at(geom, &geom.coords_at(map, b, t), boundary);
            for c in 0..geom.channels {
                let bc = b * geom.channels + c;
                output[bc * geom.out_plane + t] = stencil.sample(geom.image_plane(image, bc));
            }
        }
    }
}

/// Serial backward pass.
///
/// `grad_image` is accumulated into (callers pass zeros), `grad_map` is
/// overwritten. Both are with respect to the normalized map.
pub fn resample_grad_serial<T: Element>(
    geom: &Geometry,
    image: &[T],
    map: &[T],
    grad_output: &[T],
    boundary: BoundaryPolicy,
    grad_image: &mut [T],
    grad_map: &mut [T],
) {
    for b in 0..geom.batch {
        for t in 0..geom.out_plane {
            let stencil = Stencil::at(geom, &geom.coords_at(map, b, t), boundary);
            let mut acc = [T::zero(); MAX_DIMS];
            for c in 0..geom.channels {
                let bc = b * geom.channels + c;
                let g = grad_output[bc * geom.out_plane + t];
                let plane = bc * geom.in_plane..(bc + 1) * geom.in_plane;
                stencil.accumulate_coordinate_grad(&image[plane.clone()], g, &mut acc);
                stencil.scatter(&mut grad_image[plane], g);
            }
            for (d, &v) in acc.iter().enumerate().take(geom.ndim) {
                grad_map[(b * geom.ndim + d) * geom.out_plane + t] = v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geometry_2d(n: usize) -> Geometry {
        Geometry::new(&[1, 1, n, n], &[1, 2, n, n]).unwrap()
    }

    #[test]
    fn test_geometry_strides_and_shapes() {
        let geom = Geometry::new(&[2, 3, 4, 5, 6], &[2, 3, 7, 8, 9]).unwrap();
        assert_eq!(geom.ndim, 3);
        assert_eq!(geom.in_strides, [30, 6, 1]);
        assert_eq!(geom.in_plane, 120);
        assert_eq!(geom.out_plane, 504);
        assert_eq!(geom.output_shape(), vec![2, 3, 7, 8, 9]);
    }

    #[test]
    fn test_geometry_rejects_inconsistent_shapes() {
        assert!(Geometry::new(&[1, 1], &[1, 1]).is_err());
        assert!(Geometry::new(&[1, 1, 4, 4], &[1, 2, 4]).is_err());
        assert!(Geometry::new(&[1, 1, 4, 4], &[1, 3, 4, 4]).is_err());
        assert!(Geometry::new(&[2, 1, 4, 4], &[1, 2, 4, 4]).is_err());
        assert!(Geometry::new(&[1, 1, 0, 4], &[1, 2, 4, 4]).is_err());
    }

    #[test]
    fn test_stencil_center_of_cell() {
        // 3x3 plane, normalized (−0.5, −0.5) is index (0.5, 0.5)
        let geom = geometry_2d(3);
        let data = [0.0, 1.0, 0.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0];
        let stencil = Stencil::at(&geom, &[-0.5f64, -0.5, 0.0], BoundaryPolicy::Border);
        assert_eq!(stencil.len(), 4);
        assert_relative_eq!(stencil.sample(&data), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_stencil_zero_policy_drops_outside_corners() {
        let geom = geometry_2d(3);
        // index (-0.5, 1.0): lower x corner is outside
        let stencil = Stencil::at(&geom, &[-1.5f64, 0.0, 0.0], BoundaryPolicy::Zero);
        assert_eq!(stencil.len(), 2);
        let total: f64 = stencil.corners().map(|(_, w)| w).sum();
        assert_relative_eq!(total, 0.5, epsilon = 1e-12);

        let clamped = Stencil::at(&geom, &[-1.5f64, 0.0, 0.0], BoundaryPolicy::Border);
        assert_eq!(clamped.len(), 4);
        // every x index clamps to row 0
        assert!(clamped.corners().all(|(offset, _)| offset < 3));
    }

    #[test]
    fn test_stencil_far_outside_is_empty_under_zero_policy() {
        let geom = geometry_2d(4);
        let stencil = Stencil::at(&geom, &[f64::MAX, 0.0, 0.0], BoundaryPolicy::Zero);
        assert!(stencil.is_empty());
        let nan = Stencil::at(&geom, &[f64::NAN, 0.0, 0.0], BoundaryPolicy::Zero);
        assert!(nan.is_empty());
    }

    #[test]
    fn test_coordinate_grad_of_linear_ramp() {
        // value = x index, so d(value)/du = (n - 1) / 2
        let geom = Geometry::new(&[1, 1, 5], &[1, 1, 1]).unwrap();
        let image = [0.0, 1.0, 2.0, 3.0, 4.0];
        let map = [0.1];
        let g = coordinate_grad_at(&geom, &image, &map, &[1.0], BoundaryPolicy::Border, 0, 0);
        assert_relative_eq!(g[0], 2.0, epsilon = 1e-12);
    }
}
