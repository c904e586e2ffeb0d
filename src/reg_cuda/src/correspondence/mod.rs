//! Correspondence estimation strategies.
//!
//! Each strategy turns the current transform into weighted correspondences
//! and hands them to the pose solver, producing one transform candidate per
//! outer iteration:
//!
//! | Strategy | Correspondence | Control parameter |
//! |---|---|---|
//! | [`icp::IcpStrategy`] | nearest neighbour, weight 1 | none |
//! | [`emicp::EmIcpStrategy`] | Gaussian-mixture posterior + outlier | σ² |
//! | [`softassign::SoftassignStrategy`] | Sinkhorn-normalized assignment + slack | T |

pub mod emicp;
pub mod icp;
pub mod softassign;

use nalgebra::Vector3;

use crate::config::{Algorithm, EmIcpBackendKind, RegistrationParameters};
use crate::error::{RegistrationError, Result};
use crate::pose::DegenerateGeometry;
use crate::types::RigidTransform;

/// Result of one outer iteration of a strategy.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// New transform (source → target), or why the pose solve failed.
    pub candidate: std::result::Result<RigidTransform, DegenerateGeometry>,

    /// Mean squared correspondence distance for this iteration.
    pub residual: f64,

    /// Control value (σ² or T) used by this iteration.
    pub control: Option<f64>,

    /// Largest Sinkhorn marginal deviation of the last balanced matrix.
    pub marginal_error: Option<f64>,
}

/// One "estimate correspondences and solve" capability.
///
/// Implementations own read-only copies of the target and source sets; the
/// current transform is passed in by the engine, which alone stores it.
pub trait RegistrationStrategy: Send {
    /// Short algorithm name for logs and traces.
    fn name(&self) -> &'static str;

    /// Backend used for the heavy pass, when there is a choice.
    fn backend_name(&self) -> Option<&'static str> {
        None
    }

    /// Current control value (σ² or T); `None` for non-annealed strategies.
    fn control(&self) -> Option<f64> {
        None
    }

    /// Upper bound on outer iterations.
    fn iteration_bound(&self) -> usize;

    /// Whether the annealing schedule has run out.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Whether the engine may stop as soon as the transform stops changing.
    ///
    /// Annealed strategies keep sharpening after the pose settles, so they
    /// run their whole schedule.
    fn supports_early_stop(&self) -> bool;

    /// Estimate correspondences under `current` and solve for the next transform.
    fn iterate(&mut self, current: &RigidTransform) -> Result<StepOutcome>;

    /// Advance the control parameter after an outer iteration.
    fn anneal(&mut self) {}
}

/// Reject empty inputs.
///
/// Sets too small to fix a rotation are accepted; their iterations fail the
/// pose solver's rank check and keep the previous transform.
pub fn validate_point_sets(target: &[Vector3<f64>], source: &[Vector3<f64>]) -> Result<()> {
    for (name, set) in [("target", target), ("source", source)] {
        if set.is_empty() {
            return Err(RegistrationError::input(format!("{name} point set is empty")));
        }
    }
    Ok(())
}

/// Build the strategy selected by `params.algorithm`.
pub fn build_strategy(
    params: &RegistrationParameters,
    target: Vec<Vector3<f64>>,
    source: Vec<Vector3<f64>>,
) -> Result<Box<dyn RegistrationStrategy>> {
    params.validate()?;
    validate_point_sets(&target, &source)?;

    let strategy: Box<dyn RegistrationStrategy> = match params.algorithm {
        Algorithm::Icp => Box::new(icp::IcpStrategy::new(target, source, &params.icp)?),
        Algorithm::EmIcp => {
            let backend = emicp::select_backend(params.em_icp.backend, target)?;
            Box::new(emicp::EmIcpStrategy::new(source, &params.em_icp, backend))
        }
        Algorithm::EmIcpCpu => {
            let backend = emicp::select_backend(EmIcpBackendKind::Serial, target)?;
            Box::new(emicp::EmIcpStrategy::new(source, &params.em_icp, backend))
        }
        Algorithm::Softassign => Box::new(softassign::SoftassignStrategy::new(
            target,
            source,
            &params.softassign,
        )),
    };
    Ok(strategy)
}
