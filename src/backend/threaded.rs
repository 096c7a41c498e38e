//! Rayon thread-pool backend
//!
//! Forward values and map gradients are independent per output location and
//! are computed in parallel chunks, with one stencil per `(b, t)` shared by
//! all channels. The image gradient is a scatter-add: each task owns a
//! contiguous range of output locations and accumulates into its own buffer,
//! and the buffers are summed in task order. No two tasks ever write the same
//! memory, and the result does not depend on scheduling.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{Backend, ComputeUnit};
use crate::error::{Result, StnError};
use crate::scalar::{coordinate_grad_at, Geometry, Stencil, MAX_DIMS};
use crate::{BoundaryPolicy, Element};

/// Output locations handled per parallel work item.
const CHUNK: usize = 1024;

/// Upper bound on scatter buffers per batch, the gradient itself included.
/// Transient memory stays below `MAX_SCATTER_BUFFERS - 1` batch gradients
/// whatever the pool size.
const MAX_SCATTER_BUFFERS: usize = 4;

/// Backend running on a rayon pool.
#[derive(Debug)]
pub struct ThreadedBackend {
    /// `None` runs on rayon's global pool.
    pool: Option<ThreadPool>,
    threads: usize,
}

impl ThreadedBackend {
    /// Backend with a dedicated pool of `threads` workers.
    ///
    /// Zero is rejected rather than left to rayon's automatic sizing, so the
    /// reported unit always matches the pool.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(StnError::compute("thread count must be at least 1"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("stn-worker-{i}"))
            .build()
            .map_err(|e| StnError::compute(format!("failed to build thread pool: {e}")))?;
        Ok(Self {
            threads: pool.current_num_threads(),
            pool: Some(pool),
        })
    }

    /// Backend sharing rayon's global pool.
    pub fn global() -> Self {
        Self {
            pool: None,
            threads: rayon::current_num_threads(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn run<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Scatter the image gradient of batch `b` into `grad_batch`, which holds
    /// the `C` planes of that batch.
    fn scatter_batch<T: Element>(
        &self,
        geom: &Geometry,
        map: &[T],
        grad_output: &[T],
        boundary: BoundaryPolicy,
        b: usize,
        grad_batch: &mut [T],
    ) {
        let (span, tasks) = scatter_split(self.threads, geom.out_plane);
        let range = |task: usize| task * span..((task + 1) * span).min(geom.out_plane);

        // the first range goes straight into the gradient
        let ((), partials) = rayon::join(
            || scatter_range(geom, map, grad_output, boundary, b, range(0), &mut *grad_batch),
            || {
                (1..tasks)
                    .into_par_iter()
                    .map(|task| {
                        let mut acc = vec![T::zero(); geom.channels * geom.in_plane];
                        scatter_range(geom, map, grad_output, boundary, b, range(task), &mut acc);
                        acc
                    })
                    .collect::<Vec<Vec<T>>>()
            },
        );

        grad_batch
            .par_chunks_mut(CHUNK)
            .enumerate()
            .for_each(|(chunk, dst)| {
                let start = chunk * CHUNK;
                let len = dst.len();
                for partial in &partials {
                    for (v, &p) in dst.iter_mut().zip(&partial[start..start + len]) {
                        *v += p;
                    }
                }
            });
    }
}

/// Span of output locations per scatter task and the number of tasks.
fn scatter_split(threads: usize, out_plane: usize) -> (usize, usize) {
    let tasks = threads.clamp(1, MAX_SCATTER_BUFFERS);
    let span = out_plane.div_ceil(tasks).max(CHUNK);
    (span, out_plane.div_ceil(span))
}

/// Scatter output locations `range` of batch `b` into `acc` (`C` planes).
fn scatter_range<T: Element>(
    geom: &Geometry,
    map: &[T],
    grad_output: &[T],
    boundary: BoundaryPolicy,
    b: usize,
    range: std::ops::Range<usize>,
    acc: &mut [T],
) {
    for t in range {
        let mut stencil = None;
        for (c, plane) in acc.chunks_mut(geom.in_plane).enumerate() {
            let g = grad_output[(b * geom.channels + c) * geom.out_plane + t];
            if g == T::zero() {
                continue;
            }
            stencil
                .get_or_insert_with(|| Stencil::at(geom, &geom.coords_at(map, b, t), boundary))
                .scatter(plane, g);
        }
    }
}

/// Split `output` into work items `(b, first t, one slice per channel)`.
fn channel_chunks<'a, T>(geom: &Geometry, output: &'a mut [T]) -> Vec<(usize, usize, Vec<&'a mut [T]>)> {
    let mut work = Vec::new();
    for (b, out_batch) in output.chunks_mut(geom.channels * geom.out_plane).enumerate() {
        let mut planes: Vec<_> = out_batch
            .chunks_mut(geom.out_plane)
            .map(|plane| plane.chunks_mut(CHUNK))
            .collect();
        for chunk in 0..geom.out_plane.div_ceil(CHUNK) {
            let slices: Vec<&'a mut [T]> = planes.iter_mut().filter_map(Iterator::next).collect();
            work.push((b, chunk * CHUNK, slices));
        }
    }
    work
}

impl<T: Element> Backend<T> for ThreadedBackend {
    fn unit(&self) -> ComputeUnit {
        ComputeUnit::Threaded {
            threads: self.threads,
        }
    }

    fn resample(
        &self,
        geom: &Geometry,
        image: &[T],
        map: &[T],
        boundary: BoundaryPolicy,
        output: &mut [T],
    ) {
        self.run(|| {
            channel_chunks(geom, output)
                .into_par_iter()
                .for_each(|(b, start, mut channels)| {
                    let len = channels.first().map_or(0, |c| c.len());
                    for i in 0..len {
                        let stencil = Stencil::at(geom, &geom.coords_at(map, b, start + i), boundary);
                        for (c, out) in channels.iter_mut().enumerate() {
                            out[i] = stencil.sample(geom.image_plane(image, b * geom.channels + c));
                        }
                    }
                });
        });
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
        self.run(|| {
            let coordinate_grads: Vec<[T; MAX_DIMS]> = (0..geom.batch * geom.out_plane)
                .into_par_iter()
                .with_min_len(CHUNK)
                .map(|i| {
                    let (b, t) = (i / geom.out_plane, i % geom.out_plane);
                    coordinate_grad_at(geom, image, map, grad_output, boundary, b, t)
                })
                .collect();

            for (i, grads) in coordinate_grads.iter().enumerate() {
                let (b, t) = (i / geom.out_plane, i % geom.out_plane);
                for (d, &v) in grads.iter().enumerate().take(geom.ndim) {
                    grad_map[(b * geom.ndim + d) * geom.out_plane + t] = v;
                }
            }

            for (b, grad_batch) in grad_image
                .chunks_mut(geom.channels * geom.in_plane)
                .enumerate()
            {
                self.scatter_batch(geom, map, grad_output, boundary, b, grad_batch);
            }
        });
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::{resample_grad_serial, resample_serial};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_problem(rng: &mut StdRng) -> (Geometry, Vec<f64>, Vec<f64>, Vec<f64>) {
        let geom = Geometry::new(&[2, 3, 17, 23], &[2, 2, 40, 31]).unwrap();
        let image = (0..2 * 3 * 17 * 23).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let map = (0..2 * 2 * 40 * 31).map(|_| rng.gen_range(-1.2..1.2)).collect();
        let grad = (0..2 * 3 * 40 * 31).map(|_| rng.gen_range(-1.0..1.0)).collect();
        (geom, image, map, grad)
    }

    #[test]
    fn test_threaded_forward_matches_serial() {
        let mut rng = StdRng::seed_from_u64(7);
        let (geom, image, map, _) = random_problem(&mut rng);
        let backend = ThreadedBackend::new(4).unwrap();

        for boundary in [BoundaryPolicy::Border, BoundaryPolicy::Zero] {
            let mut serial = vec![0.0; 2 * 3 * 40 * 31];
            let mut threaded = serial.clone();
            resample_serial(&geom, &image, &map, boundary, &mut serial);
            backend.resample(&geom, &image[..], &map[..], boundary, &mut threaded[..]);
            assert_eq!(serial, threaded);
        }
    }

    #[test]
    fn test_threaded_gradients_match_serial() {
        let mut rng = StdRng::seed_from_u64(11);
        let (geom, image, map, grad) = random_problem(&mut rng);
        let backend = ThreadedBackend::new(3).unwrap();

        for boundary in [BoundaryPolicy::Border, BoundaryPolicy::Zero] {
            let mut gi_serial = vec![0.0; image.len()];
            let mut gm_serial = vec![0.0; map.len()];
            resample_grad_serial(&geom, &image, &map, &grad, boundary, &mut gi_serial, &mut gm_serial);

            let mut gi_threaded = vec![0.0; image.len()];
            let mut gm_threaded = vec![0.0; map.len()];
            backend.resample_grad(
                &geom,
                &image[..],
                &map[..],
                &grad[..],
                boundary,
                &mut gi_threaded[..],
                &mut gm_threaded[..],
            );

            assert_eq!(gm_serial, gm_threaded);
            let max_diff = gi_serial
                .iter()
                .zip(&gi_threaded)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f64, f64::max);
            assert!(max_diff < 1e-12, "scatter mismatch {max_diff}");
        }
    }

    #[test]
    fn test_threaded_scatter_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let (geom, image, map, grad) = random_problem(&mut rng);
        let backend = ThreadedBackend::new(4).unwrap();

        let run = || {
            let mut gi = vec![0.0; image.len()];
            let mut gm = vec![0.0; map.len()];
            backend.resample_grad(
                &geom,
                &image[..],
                &map[..],
                &grad[..],
                BoundaryPolicy::Border,
                &mut gi[..],
                &mut gm[..],
            );
            gi
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(ThreadedBackend::new(0), Err(StnError::Compute(_))));
        let backend = ThreadedBackend::new(2).unwrap();
        assert_eq!(Backend::<f64>::unit(&backend), ComputeUnit::Threaded { threads: 2 });
    }

    #[test]
    fn test_scatter_buffers_are_bounded() {
        let volume = 256 * 256 * 256;
        for threads in [1, 2, 32, 64, 1024] {
            let (span, tasks) = scatter_split(threads, volume);
            assert!((1..=MAX_SCATTER_BUFFERS).contains(&tasks), "{threads} threads -> {tasks} tasks");
            assert!(span * tasks >= volume);
            assert!(span * (tasks - 1) < volume);
        }
        // small planes stay in one task and scatter without extra buffers
        assert_eq!(scatter_split(64, 100), (CHUNK, 1));
    }

    #[test]
    fn test_wide_pool_gradients_match_serial() {
        // more workers than buffers, several tasks per batch
        let geom = Geometry::new(&[1, 2, 9, 8, 7], &[1, 3, 20, 16, 15]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let image: Vec<f64> = (0..2 * 9 * 8 * 7).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let map: Vec<f64> = (0..3 * 4800).map(|_| rng.gen_range(-1.1..1.1)).collect();
        let grad: Vec<f64> = (0..2 * 4800).map(|_| rng.gen_range(-1.0..1.0)).collect();
        assert!(scatter_split(16, geom.out_plane).1 > 1);

        let backend = ThreadedBackend::new(16).unwrap();
        let mut gi_serial = vec![0.0; image.len()];
        let mut gm_serial = vec![0.0; map.len()];
        resample_grad_serial(&geom, &image, &map, &grad, BoundaryPolicy::Zero, &mut gi_serial, &mut gm_serial);
        let mut gi = vec![0.0; image.len()];
        let mut gm = vec![0.0; map.len()];
        backend.resample_grad(
            &geom,
            &image[..],
            &map[..],
            &grad[..],
            BoundaryPolicy::Zero,
            &mut gi[..],
            &mut gm[..],
        );
        assert_eq!(gm_serial, gm);
        for (a, b) in gi_serial.iter().zip(&gi) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
