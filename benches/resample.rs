//! Benchmarks for forward and backward D-linear resampling

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{ArrayD, Dimension, IxDyn};
use stn_nd::{grid, ComputeCapabilities, ComputeUnit, SpatialTransformer};

/// Image, slightly shifted physical map and unit upstream gradient on a cube.
fn problem(dim: usize, size: usize) -> (ArrayD<f32>, ArrayD<f32>, ArrayD<f32>, Vec<f64>) {
    let spacing = vec![1.0; dim];
    let extent = vec![size; dim];
    let mut shape = vec![1, 1];
    shape.extend_from_slice(&extent);

    let image = ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
        (idx.slice().iter().skip(2).sum::<usize>() % 256) as f32 / 255.0
    });
    let map = grid::identity_map::<f32>(&extent, &spacing)
        .expect("valid identity map")
        .mapv(|v| v + 0.37);
    let upstream = ArrayD::ones(IxDyn(&shape));
    (image, map, upstream, spacing)
}

fn units() -> Vec<ComputeUnit> {
    let caps = ComputeCapabilities::detect();
    let mut units = vec![ComputeUnit::Serial];
    if caps.threaded {
        units.push(caps.preferred_unit());
    }
    units
}

fn benchmark_forward(c: &mut Criterion) {
    let caps = ComputeCapabilities::detect();
    for (dim, sizes) in [(2, &[128usize, 512][..]), (3, &[32, 96][..])] {
        let mut group = c.benchmark_group(format!("forward_{dim}d_f32"));
        for &size in sizes {
            let (image, map, _, spacing) = problem(dim, size);
            group.throughput(Throughput::Elements((size as u64).pow(dim as u32)));

            for unit in units() {
                let mut stn = SpatialTransformer::with_unit(&spacing, false, unit, &caps)
                    .expect("supported unit");
                group.bench_with_input(BenchmarkId::new(unit.to_string(), size), &size, |b, _| {
                    b.iter(|| {
                        let out = stn.forward(&image.view(), &map.view()).expect("forward");
                        stn.reset();
                        black_box(out)
                    })
                });
            }
        }
        group.finish();
    }
}

fn benchmark_backward(c: &mut Criterion) {
    let caps = ComputeCapabilities::detect();
    for (dim, sizes) in [(2, &[128usize, 512][..]), (3, &[32, 96][..])] {
        let mut group = c.benchmark_group(format!("forward_backward_{dim}d_f32"));
        for &size in sizes {
            let (image, map, upstream, spacing) = problem(dim, size);
            group.throughput(Throughput::Elements((size as u64).pow(dim as u32)));

            for unit in units() {
                let mut stn = SpatialTransformer::with_unit(&spacing, true, unit, &caps)
                    .expect("supported unit");
                group.bench_with_input(BenchmarkId::new(unit.to_string(), size), &size, |b, _| {
                    b.iter(|| {
                        stn.forward(&image.view(), &map.view()).expect("forward");
                        black_box(stn.backward(&upstream.view()).expect("backward"))
                    })
                });
            }
        }
        group.finish();
    }
}

criterion_group!(benches, benchmark_forward, benchmark_backward);
criterion_main!(benches);
