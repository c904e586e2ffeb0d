//! Command-line driver: load two point clouds, register the source (Y) onto
//! the target (X) and report the recovered rigid transform.

mod pointcloud;
mod preprocess;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use reg_cuda::{
    read_transform, write_transform, Algorithm, EmIcpBackendKind, RegistrationBuilder,
    RegistrationParameters, RegistrationStatus, RigidTransform,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AlgorithmArg {
    Icp,
    Emicp,
    EmicpCpu,
    Softassign,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Icp => Algorithm::Icp,
            AlgorithmArg::Emicp => Algorithm::EmIcp,
            AlgorithmArg::EmicpCpu => Algorithm::EmIcpCpu,
            AlgorithmArg::Softassign => Algorithm::Softassign,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Serial,
    Parallel,
    Cuda,
}

impl From<BackendArg> for EmIcpBackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Serial => EmIcpBackendKind::Serial,
            BackendArg::Parallel => EmIcpBackendKind::Parallel,
            BackendArg::Cuda => EmIcpBackendKind::Cuda,
        }
    }
}

/// Rigid 3-D point-set registration (ICP, EM-ICP, Softassign).
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Target point cloud X (.ply, .xyz, .txt).
    #[arg(long)]
    point_file_x: PathBuf,

    /// Source point cloud Y, registered onto X.
    #[arg(long)]
    point_file_y: PathBuf,

    /// Registration algorithm [default: softassign, or the --config value].
    #[arg(long, value_enum)]
    algorithm: Option<AlgorithmArg>,

    /// JSON parameter file; command-line options override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// ICP: maximum outer iterations.
    #[arg(long)]
    max_iteration: Option<usize>,

    /// EM-ICP: initial variance.
    #[arg(long)]
    sigma_p2: Option<f64>,

    /// EM-ICP: variance floor.
    #[arg(long)]
    sigma_inf: Option<f64>,

    /// EM-ICP: variance decay factor.
    #[arg(long)]
    sigma_factor: Option<f64>,

    /// EM-ICP: outlier distance scale.
    #[arg(long)]
    d_02: Option<f64>,

    /// EM-ICP: outlier strength (0 disables the outlier component).
    #[arg(long)]
    outlier_weight: Option<f64>,

    /// EM-ICP: expectation backend for `--algorithm emicp`.
    #[arg(long, value_enum)]
    emicp_backend: Option<BackendArg>,

    /// Softassign: outer iteration bound.
    #[arg(long)]
    jmax: Option<usize>,

    /// Softassign: normalization passes per assignment pass.
    #[arg(long)]
    i0: Option<usize>,

    /// Softassign: assignment passes per temperature.
    #[arg(long)]
    i1: Option<usize>,

    /// Softassign: distance offset.
    #[arg(long)]
    alpha: Option<f64>,

    /// Softassign: initial temperature.
    #[arg(long)]
    t_0: Option<f64>,

    /// Softassign: temperature decay factor.
    #[arg(long)]
    t_factor: Option<f64>,

    /// Softassign: slack entry value [default: e^-1 / sqrt(T_0)].
    #[arg(long)]
    moutlier: Option<f64>,

    /// Softassign: temperature floor.
    #[arg(long)]
    t_min: Option<f64>,

    /// Softassign: Sinkhorn marginal tolerance.
    #[arg(long)]
    sinkhorn_epsilon: Option<f64>,

    /// Convergence threshold on rotation angle plus translation change.
    #[arg(long)]
    transformation_epsilon: Option<f64>,

    /// ICP convergence threshold on residual change.
    #[arg(long)]
    residual_epsilon: Option<f64>,

    /// Keep this percentage of points of both clouds.
    #[arg(long, value_name = "PERCENT")]
    points_reduction_rate: Option<f64>,

    /// Keep this percentage of target points (ignored with --points-reduction-rate).
    #[arg(long, value_name = "PERCENT")]
    points_reduction_rate_x: Option<f64>,

    /// Keep this percentage of source points (ignored with --points-reduction-rate).
    #[arg(long, value_name = "PERCENT")]
    points_reduction_rate_y: Option<f64>,

    /// Seed for random subsampling.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Normalize both clouds to a small fixed covariance trace before registration.
    #[arg(long)]
    align_scale_once: bool,

    /// Scale the source so its spread matches the target's.
    #[arg(long)]
    align_scale_to_target: bool,

    /// Start from the transform stored in this file.
    #[arg(long)]
    load_rt_from_file: Option<PathBuf>,

    /// Save the final transform to this file.
    #[arg(long)]
    save_rt_to_file: Option<PathBuf>,

    /// Write the per-iteration trace as JSON.
    #[arg(long)]
    trace_json: Option<PathBuf>,

    /// Do not report elapsed time.
    #[arg(long)]
    no_timer: bool,

    /// Run to completion without pausing before registration.
    #[arg(long)]
    no_stop: bool,
}

impl Args {
    /// Parameters from `--config` (or defaults) with command-line overrides.
    fn parameters(&self) -> Result<RegistrationParameters> {
        let mut params = match &self.config {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                RegistrationParameters::from_json(&json)
                    .with_context(|| format!("invalid parameter file {}", path.display()))?
            }
            None => RegistrationParameters::default(),
        };

        if let Some(algorithm) = self.algorithm {
            params.algorithm = algorithm.into();
        }
        if let Some(v) = self.max_iteration {
            params.icp.max_iteration = v;
        }

        let em = &mut params.em_icp;
        if let Some(v) = self.sigma_p2 {
            em.sigma_p2 = v;
        }
        if let Some(v) = self.sigma_inf {
            em.sigma_inf = v;
        }
        if let Some(v) = self.sigma_factor {
            em.sigma_factor = v;
        }
        if let Some(v) = self.d_02 {
            em.d_02 = v;
        }
        if let Some(v) = self.outlier_weight {
            em.outlier_weight = v;
        }
        if let Some(v) = self.emicp_backend {
            em.backend = v.into();
        }

        let sa = &mut params.softassign;
        if let Some(v) = self.jmax {
            sa.jmax = v;
        }
        if let Some(v) = self.i0 {
            sa.i0 = v;
        }
        if let Some(v) = self.i1 {
            sa.i1 = v;
        }
        if let Some(v) = self.alpha {
            sa.alpha = v;
        }
        if let Some(v) = self.t_0 {
            sa.t_0 = v;
        }
        if let Some(v) = self.t_factor {
            sa.t_factor = v;
        }
        if self.moutlier.is_some() {
            sa.moutlier = self.moutlier;
        }
        if self.t_min.is_some() {
            sa.t_min = self.t_min;
        }
        if let Some(v) = self.sinkhorn_epsilon {
            sa.sinkhorn_epsilon = v;
        }

        if let Some(v) = self.transformation_epsilon {
            params.convergence.transformation_epsilon = v;
        }
        if let Some(v) = self.residual_epsilon {
            params.convergence.residual_epsilon = v;
        }
        Ok(params)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let params = args.parameters()?;
    info!(algorithm = params.algorithm.name(), "Parameters loaded");

    let mut target = pointcloud::load_points(&args.point_file_x)?;
    let mut source = pointcloud::load_points(&args.point_file_y)?;

    if args.align_scale_once {
        let (s_target, s_source) = preprocess::align_scale_once(&mut target, &mut source)?;
        info!(s_target, s_source, "Normalized cloud scales");
    }
    if args.align_scale_to_target {
        let s = preprocess::align_scale_to_target(&target, &mut source)?;
        info!(scale = s, "Scaled source to target");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    if let Some(rate) = args.points_reduction_rate {
        target = preprocess::subsample(&target, rate, &mut rng)?;
        source = preprocess::subsample(&source, rate, &mut rng)?;
        info!("Points of X and Y reduced to {rate}% of original");
    } else {
        if let Some(rate) = args.points_reduction_rate_x {
            target = preprocess::subsample(&target, rate, &mut rng)?;
            info!("Points of X reduced to {rate}% of original");
        }
        if let Some(rate) = args.points_reduction_rate_y {
            source = preprocess::subsample(&source, rate, &mut rng)?;
            info!("Points of Y reduced to {rate}% of original");
        }
    }
    info!(x_size = target.len(), y_size = source.len(), "Point clouds ready");

    let initial = match &args.load_rt_from_file {
        Some(path) => read_transform(path)
            .with_context(|| format!("failed to load initial transform {}", path.display()))?,
        None => RigidTransform::identity(),
    };
    println!("{initial}");

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl-C handler")?;
    }
    if !args.no_stop {
        info!("Press Ctrl-C to stop after the current iteration");
    }

    let registration = RegistrationBuilder::new()
        .parameters(params)
        .initial_transform(initial)
        .cancel_flag(Arc::clone(&cancel))
        .build()?;

    let start = Instant::now();
    let result = registration.register(&target, &source)?;
    let elapsed = start.elapsed();

    match result.status {
        RegistrationStatus::Converged => info!(iterations = result.iterations, "Converged"),
        RegistrationStatus::IterationLimitReached => {
            info!(iterations = result.iterations, "Iteration limit reached")
        }
        RegistrationStatus::Cancelled => {
            warn!(iterations = result.iterations, "Cancelled; reporting last valid transform")
        }
    }
    if !args.no_timer {
        println!("Elapsed time: {:.3} [s]", elapsed.as_secs_f64());
    }
    println!("{}", result.transform);

    if let Some(path) = &args.save_rt_to_file {
        write_transform(path, &result.transform)
            .with_context(|| format!("failed to save transform {}", path.display()))?;
        info!(path = %path.display(), "Saved transform");
    }
    if let Some(path) = &args.trace_json {
        let json = result
            .trace
            .to_json_pretty()
            .context("failed to serialize trace")?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Wrote iteration trace");
    }

    Ok(())
}
