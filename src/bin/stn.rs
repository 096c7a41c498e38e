//! stn CLI: inspect compute capabilities and verify operator gradients.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stn_nd::gradcheck::check_gradients;
use stn_nd::{ComputeCapabilities, DeviceRequest, SpatialTransformer, TransformerConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "stn")]
#[command(about = "Differentiable N-D spatial transformer")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print compute capabilities of this build and machine.
    Info,
    /// Compare analytic gradients against finite differences on random data.
    Check {
        /// Spatial dimension.
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=3))]
        dim: u8,

        /// Extent of every spatial axis.
        #[arg(long, default_value_t = 6)]
        size: usize,

        /// Batch size.
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Image channels.
        #[arg(long, default_value_t = 2)]
        channels: usize,

        /// Treat out-of-range samples as zero instead of clamping.
        #[arg(long)]
        zero_boundary: bool,

        /// Compute device: auto, serial or threaded.
        #[arg(long, default_value = "auto")]
        device: DeviceRequest,

        /// Worker threads for the threaded device.
        #[arg(long)]
        threads: Option<usize>,

        /// Random seed.
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Operator configuration (JSON); overrides the flags above.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Finite-difference step.
        #[arg(long, default_value_t = 1e-6)]
        eps: f64,

        /// Largest accepted relative error.
        #[arg(long, default_value_t = 1e-4)]
        tolerance: f64,
    },
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Info => run_info(),
        Commands::Check {
            dim,
            size,
            batch,
            channels,
            zero_boundary,
            device,
            threads,
            seed,
            config,
            eps,
            tolerance,
        } => {
            let config = match config {
                Some(path) => TransformerConfig::from_path(&path)?,
                None => {
                    let spacing = 1.0 / (size.max(2) - 1) as f64;
                    TransformerConfig {
                        spacing: vec![spacing; dim as usize],
                        zero_boundary,
                        device,
                        threads,
                    }
                }
            };
            run_check(&config, size, batch, channels, seed, eps, tolerance)
        }
    }
}

fn run_info() -> CliResult<()> {
    let caps = ComputeCapabilities::detect();
    println!("stn-nd {}", env!("CARGO_PKG_VERSION"));
    println!("threaded backend: {}", if caps.threaded { "yes" } else { "no" });
    println!("max threads:      {}", caps.max_threads);
    println!("preferred unit:   {}", caps.preferred_unit());
    Ok(())
}

fn run_check(
    config: &TransformerConfig,
    size: usize,
    batch: usize,
    channels: usize,
    seed: u64,
    eps: f64,
    tolerance: f64,
) -> CliResult<()> {
    if size == 0 || batch == 0 || channels == 0 {
        return Err("size, batch and channels must be positive".into());
    }
    let caps = ComputeCapabilities::detect();
    let mut stn = SpatialTransformer::<f64>::from_config(config, &caps)?;
    let dim = config.spacing.len();
    tracing::info!(
        dim,
        size,
        boundary = ?stn.boundary(),
        unit = %stn.unit(),
        "checking gradients"
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let extent = vec![size; dim];
    let mut image_shape = vec![batch, channels];
    image_shape.extend_from_slice(&extent);
    let mut map_shape = vec![batch, dim];
    map_shape.extend_from_slice(&extent);

    let image = ArrayD::from_shape_fn(IxDyn(&image_shape), |_| rng.gen_range(-1.0..1.0));
    // Index positions stay 0.2 away from grid lines and may fall one voxel
    // outside the image.
    let map = ArrayD::from_shape_fn(IxDyn(&map_shape), |idx| {
        let cell = rng.gen_range(-1..size as i64) as f64;
        (cell + rng.gen_range(0.2..0.8)) * config.spacing[idx[1]]
    });
    let upstream = ArrayD::from_shape_fn(IxDyn(&image_shape), |_| rng.gen_range(-1.0..1.0));

    let report = check_gradients(&mut stn, &image.view(), &map.view(), &upstream.view(), eps)?;
    tracing::info!(
        image_error = report.image_error,
        map_error = report.map_error,
        checked = report.checked,
        "gradient check"
    );

    if !report.passes(tolerance) {
        return Err(format!(
            "gradient error {:.3e} exceeds tolerance {:.1e}",
            report.max_error(),
            tolerance
        )
        .into());
    }
    println!("ok: max relative error {:.3e}", report.max_error());
    Ok(())
}
