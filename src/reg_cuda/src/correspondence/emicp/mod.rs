//! EM-ICP: registration as maximum-likelihood fitting to a Gaussian mixture.
//!
//! The target points are the centers of isotropic Gaussians with variance σ²;
//! one extra uniform-like component absorbs outliers. For a transformed
//! source point yᵢ the posterior of component j is
//!
//! ```text
//! eᵢⱼ = ‖yᵢ − xⱼ‖² / (2σ²)
//! e₀  = d_02 / (2σ²) − ln(outlier_weight)
//! pᵢⱼ = exp(−eᵢⱼ) / (Σₖ exp(−eᵢₖ) + exp(−e₀))
//! ```
//!
//! so a point farther than about √d_02 from every target puts most of its
//! mass into the outlier bucket. Exponents are shifted by `min(eᵢⱼ, e₀)`
//! before exponentiating, which keeps the denominator ≥ 1 at any σ².
//!
//! The M-step only needs each row's inlier mass λᵢ and weighted target mean,
//! collected in a [`SoftMatch`]. Backends differ only in how rows are mapped:
//!
//! - [`SerialBackend`]: one row after another (reference)
//! - [`ParallelBackend`]: Rayon map over rows, identical per-row arithmetic
//! - `CudaBackend`: one CubeCL thread per row (feature `cuda`)

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod gpu;
#[cfg(feature = "cuda")]
pub mod kernels;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{RegistrationStrategy, StepOutcome};
use crate::annealing::AnnealingSchedule;
use crate::config::{EmIcpBackendKind, EmIcpConfig};
use crate::error::Result;
use crate::pose::{soft_residual, solve_soft_matches, SoftMatch};
use crate::types::RigidTransform;

pub use cpu::{ParallelBackend, SerialBackend};

/// Rows whose inlier mass is below this are left out of the M-step.
pub const MIN_ROW_MASS: f64 = 1e-12;

/// Outlier component of the mixture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierModel {
    /// Squared distance scale of the outlier component.
    pub d_02: f64,

    /// Outlier strength; zero removes the component.
    pub weight: f64,
}

impl OutlierModel {
    pub fn new(d_02: f64, weight: f64) -> Self {
        Self { d_02, weight }
    }

    pub fn from_config(config: &EmIcpConfig) -> Self {
        Self::new(config.d_02, config.outlier_weight)
    }

    /// Exponent e₀ competing with the real components at variance `sigma2`.
    pub fn exponent(&self, sigma2: f64) -> Option<f64> {
        (self.weight > 0.0).then(|| self.d_02 / (2.0 * sigma2) - self.weight.ln())
    }
}

/// Dense posterior row for one transformed source point.
///
/// Returns the weight of every target and the outlier mass; together they
/// sum to 1.
pub fn posterior_row(
    target: &[Vector3<f64>],
    point: &Vector3<f64>,
    sigma2: f64,
    outlier: &OutlierModel,
) -> (Vec<f64>, f64) {
    let inv = 1.0 / (2.0 * sigma2);
    let exponents: Vec<f64> = target.iter().map(|x| (x - point).norm_squared() * inv).collect();
    let e0 = outlier.exponent(sigma2);
    let shift = row_shift(exponents.iter().copied(), e0);

    let mut weights: Vec<f64> = exponents.iter().map(|e| (shift - e).exp()).collect();
    let mut outlier_mass = e0.map_or(0.0, |e0| (shift - e0).exp());
    let z: f64 = weights.iter().sum::<f64>() + outlier_mass;
    for w in &mut weights {
        *w /= z;
    }
    outlier_mass /= z;
    (weights, outlier_mass)
}

/// Collapsed posterior row: inlier mass and weighted target mean.
///
/// Shared by the serial and parallel backends so both produce bitwise
/// identical rows.
pub fn soft_match_row(
    target: &[Vector3<f64>],
    point: &Vector3<f64>,
    sigma2: f64,
    outlier: &OutlierModel,
) -> SoftMatch {
    let inv = 1.0 / (2.0 * sigma2);
    let e0 = outlier.exponent(sigma2);
    let shift = row_shift(target.iter().map(|x| (x - point).norm_squared() * inv), e0);

    let mut mass = 0.0;
    let mut weighted_sum = Vector3::zeros();
    for x in target {
        let w = (shift - (x - point).norm_squared() * inv).exp();
        mass += w;
        weighted_sum += x * w;
    }
    let z = mass + e0.map_or(0.0, |e0| (shift - e0).exp());

    let mass = mass / z;
    if mass < MIN_ROW_MASS {
        return SoftMatch::empty();
    }
    SoftMatch::from_weighted_sum(mass, weighted_sum / z)
}

/// Smallest exponent of a row, outlier included.
fn row_shift(exponents: impl Iterator<Item = f64>, outlier_exponent: Option<f64>) -> f64 {
    let m = exponents.fold(f64::INFINITY, f64::min);
    match outlier_exponent {
        Some(e0) => m.min(e0),
        None => m,
    }
}

/// Expectation-step backend.
///
/// Holds the target set (uploaded once for device backends) and maps every
/// transformed source point to its collapsed posterior row.
pub trait EStepBackend: Send {
    fn name(&self) -> &'static str;

    /// One E-step over `moved_source` (source points under the current transform).
    fn expectation(
        &mut self,
        moved_source: &[Vector3<f64>],
        sigma2: f64,
        outlier: &OutlierModel,
    ) -> Result<Vec<SoftMatch>>;
}

/// Create the requested backend, falling back to Rayon when CUDA is unusable.
pub fn select_backend(
    kind: EmIcpBackendKind,
    target: Vec<Vector3<f64>>,
) -> Result<Box<dyn EStepBackend>> {
    match kind {
        EmIcpBackendKind::Serial => Ok(Box::new(SerialBackend::new(target))),
        EmIcpBackendKind::Parallel => Ok(Box::new(ParallelBackend::new(target))),
        EmIcpBackendKind::Cuda => cuda_or_parallel(target),
    }
}

#[cfg(feature = "cuda")]
fn cuda_or_parallel(target: Vec<Vector3<f64>>) -> Result<Box<dyn EStepBackend>> {
    if gpu::is_cuda_available() {
        match gpu::CudaBackend::new(&target) {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(e) => warn!("CUDA backend initialization failed, using parallel CPU backend: {e}"),
        }
    } else {
        warn!("CUDA not available, using parallel CPU backend");
    }
    Ok(Box::new(ParallelBackend::new(target)))
}

#[cfg(not(feature = "cuda"))]
fn cuda_or_parallel(target: Vec<Vector3<f64>>) -> Result<Box<dyn EStepBackend>> {
    warn!("Built without the `cuda` feature, using parallel CPU backend");
    Ok(Box::new(ParallelBackend::new(target)))
}

/// EM-ICP strategy: one E-step and one M-step per σ², then σ² decays.
pub struct EmIcpStrategy {
    source: Vec<Vector3<f64>>,
    backend: Box<dyn EStepBackend>,
    outlier: OutlierModel,
    schedule: AnnealingSchedule,
}

impl EmIcpStrategy {
    /// The target set lives in `backend`.
    pub fn new(
        source: Vec<Vector3<f64>>,
        config: &EmIcpConfig,
        backend: Box<dyn EStepBackend>,
    ) -> Self {
        Self {
            source,
            backend,
            outlier: OutlierModel::from_config(config),
            schedule: AnnealingSchedule::with_floor(
                config.sigma_p2,
                config.sigma_factor,
                config.sigma_inf,
            ),
        }
    }

    pub fn schedule(&self) -> &AnnealingSchedule {
        &self.schedule
    }
}

impl RegistrationStrategy for EmIcpStrategy {
    fn name(&self) -> &'static str {
        if self.backend.name() == "serial" {
            "emicp-cpu"
        } else {
            "emicp"
        }
    }

    fn backend_name(&self) -> Option<&'static str> {
        Some(self.backend.name())
    }

    fn control(&self) -> Option<f64> {
        Some(self.schedule.current())
    }

    fn iteration_bound(&self) -> usize {
        self.schedule.planned_steps()
    }

    fn is_exhausted(&self) -> bool {
        self.schedule.is_exhausted()
    }

    fn supports_early_stop(&self) -> bool {
        false
    }

    fn iterate(&mut self, current: &RigidTransform) -> Result<StepOutcome> {
        let sigma2 = self.schedule.current();
        let moved = current.apply_all(&self.source);

        let matches = self.backend.expectation(&moved, sigma2, &self.outlier)?;
        let candidate = solve_soft_matches(&self.source, &matches);
        let residual = match &candidate {
            Ok(t) => soft_residual(&self.source, &matches, t),
            Err(_) => soft_residual(&self.source, &matches, current),
        };

        Ok(StepOutcome {
            candidate,
            residual,
            control: Some(sigma2),
            marginal_error: None,
        })
    }

    fn anneal(&mut self) {
        self.schedule.advance();
    }
}
