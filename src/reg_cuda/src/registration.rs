//! High-level registration API.
//!
//! ```ignore
//! let result = RegistrationBuilder::new()
//!     .algorithm(Algorithm::Softassign)
//!     .t_0(1.0)
//!     .jmax(60)
//!     .build()?
//!     .register(&target, &source)?;
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::{Algorithm, EmIcpBackendKind, RegistrationParameters};
use crate::engine::RegistrationEngine;
use crate::error::Result;
use crate::types::{RegistrationResult, RigidTransform};

/// Builder for [`Registration`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationBuilder {
    params: RegistrationParameters,
    initial: Option<RigidTransform>,
    cancel: Option<Arc<AtomicBool>>,
}

impl RegistrationBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete parameter set (e.g. loaded from JSON).
    pub fn parameters(mut self, params: RegistrationParameters) -> Self {
        self.params = params;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.params.algorithm = algorithm;
        self
    }

    /// ICP outer iteration bound.
    pub fn max_iteration(mut self, max_iteration: usize) -> Self {
        self.params.icp.max_iteration = max_iteration;
        self
    }

    /// EM-ICP initial variance.
    pub fn sigma_p2(mut self, sigma_p2: f64) -> Self {
        self.params.em_icp.sigma_p2 = sigma_p2;
        self
    }

    /// EM-ICP variance floor.
    pub fn sigma_inf(mut self, sigma_inf: f64) -> Self {
        self.params.em_icp.sigma_inf = sigma_inf;
        self
    }

    /// EM-ICP per-step variance decay.
    pub fn sigma_factor(mut self, sigma_factor: f64) -> Self {
        self.params.em_icp.sigma_factor = sigma_factor;
        self
    }

    /// EM-ICP outlier distance scale.
    pub fn d_02(mut self, d_02: f64) -> Self {
        self.params.em_icp.d_02 = d_02;
        self
    }

    /// EM-ICP outlier strength (0 disables the outlier component).
    pub fn outlier_weight(mut self, weight: f64) -> Self {
        self.params.em_icp.outlier_weight = weight;
        self
    }

    /// EM-ICP expectation backend for `Algorithm::EmIcp`.
    pub fn em_icp_backend(mut self, backend: EmIcpBackendKind) -> Self {
        self.params.em_icp.backend = backend;
        self
    }

    /// Softassign outer iteration bound.
    pub fn jmax(mut self, jmax: usize) -> Self {
        self.params.softassign.jmax = jmax;
        self
    }

    /// Softassign Sinkhorn passes per assignment pass.
    pub fn i0(mut self, i0: usize) -> Self {
        self.params.softassign.i0 = i0;
        self
    }

    /// Softassign assignment passes per temperature.
    pub fn i1(mut self, i1: usize) -> Self {
        self.params.softassign.i1 = i1;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.params.softassign.alpha = alpha;
        self
    }

    pub fn t_0(mut self, t_0: f64) -> Self {
        self.params.softassign.t_0 = t_0;
        self
    }

    pub fn t_factor(mut self, t_factor: f64) -> Self {
        self.params.softassign.t_factor = t_factor;
        self
    }

    /// Softassign slack value (default `e⁻¹/√T_0`).
    pub fn moutlier(mut self, moutlier: f64) -> Self {
        self.params.softassign.moutlier = Some(moutlier);
        self
    }

    /// Softassign temperature floor.
    pub fn t_min(mut self, t_min: f64) -> Self {
        self.params.softassign.t_min = Some(t_min);
        self
    }

    pub fn sinkhorn_epsilon(mut self, epsilon: f64) -> Self {
        self.params.softassign.sinkhorn_epsilon = epsilon;
        self
    }

    /// Set transformation epsilon for convergence.
    pub fn transformation_epsilon(mut self, epsilon: f64) -> Self {
        self.params.convergence.transformation_epsilon = epsilon;
        self
    }

    pub fn residual_epsilon(mut self, epsilon: f64) -> Self {
        self.params.convergence.residual_epsilon = epsilon;
        self
    }

    /// Initial guess, e.g. loaded with [`crate::read_transform`].
    pub fn initial_transform(mut self, initial: RigidTransform) -> Self {
        self.initial = Some(initial);
        self
    }

    /// Flag checked between outer iterations.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Registration> {
        self.params.validate()?;
        Ok(Registration {
            params: self.params,
            initial: self.initial,
            cancel: self.cancel,
        })
    }
}

/// Validated, reusable registration setup.
#[derive(Debug, Clone)]
pub struct Registration {
    params: RegistrationParameters,
    initial: Option<RigidTransform>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Registration {
    pub fn params(&self) -> &RegistrationParameters {
        &self.params
    }

    /// Engine ready to run on the given sets.
    pub fn engine(&self, target: &[[f32; 3]], source: &[[f32; 3]]) -> Result<RegistrationEngine> {
        let mut engine = RegistrationEngine::new(target, source, &self.params)?;
        if let Some(initial) = self.initial {
            engine = engine.with_initial_transform(initial);
        }
        if let Some(flag) = &self.cancel {
            engine = engine.with_cancel_flag(Arc::clone(flag));
        }
        Ok(engine)
    }

    /// Register `source` onto `target`.
    pub fn register(&self, target: &[[f32; 3]], source: &[[f32; 3]]) -> Result<RegistrationResult> {
        self.engine(target, source)?.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistrationError;
    use crate::test_utils::{make_random_cloud, small_perturbation, transform_cloud};
    use crate::types::RegistrationStatus;
    use approx::assert_relative_eq;

    #[test]
    fn test_builder_sets_parameters() {
        let reg = RegistrationBuilder::new()
            .algorithm(Algorithm::EmIcpCpu)
            .sigma_p2(0.02)
            .sigma_factor(0.8)
            .d_02(0.05)
            .build()
            .unwrap();
        let p = reg.params();
        assert_eq!(p.algorithm, Algorithm::EmIcpCpu);
        assert_eq!(p.em_icp.sigma_p2, 0.02);
        assert_eq!(p.em_icp.sigma_factor, 0.8);
        assert_eq!(p.em_icp.d_02, 0.05);
        assert_eq!(p.em_icp.sigma_inf, 1e-5);
    }

    #[test]
    fn test_builder_rejects_invalid() {
        let err = RegistrationBuilder::new()
            .algorithm(Algorithm::Softassign)
            .t_factor(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Configuration(_)));
    }

    #[test]
    fn test_register_from_initial_guess() {
        let target = make_random_cloud(200, 81);
        let applied = small_perturbation();
        let source = transform_cloud(&target, &applied);

        // Starting at the answer, ICP converges immediately.
        let result = RegistrationBuilder::new()
            .algorithm(Algorithm::Icp)
            .initial_transform(applied.inverse())
            .build()
            .unwrap()
            .register(&target, &source)
            .unwrap();
        assert_eq!(result.status, RegistrationStatus::Converged);
        assert!(result.iterations <= 2);
        assert_relative_eq!(result.transform.rotation, applied.inverse().rotation, epsilon = 1e-5);
    }

    #[test]
    fn test_cancel_flag_forwarded() {
        let cloud = make_random_cloud(30, 82);
        let flag = Arc::new(AtomicBool::new(true));
        let result = RegistrationBuilder::new()
            .algorithm(Algorithm::Icp)
            .cancel_flag(flag)
            .build()
            .unwrap()
            .register(&cloud, &cloud)
            .unwrap();
        assert_eq!(result.status, RegistrationStatus::Cancelled);
    }
}
