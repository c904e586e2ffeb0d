//! Registration engine: the outer iteration loop.
//!
//! ```text
//! Initializing → OuterIterating → Solving → CheckingConvergence ─┐
//!                      ▲                                         │
//!                      └─────────────────────────────────────────┤
//!                                  Converged | IterationLimitReached | Cancelled
//! ```
//!
//! The engine alone owns the current transform and the transformed working
//! copy of the source set. Both are written once per outer iteration, after
//! the strategy returns its candidate. Cancellation (observer or flag) is
//! only honoured between outer iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::config::{ConvergenceConfig, RegistrationParameters};
use crate::correspondence::{build_strategy, RegistrationStrategy};
use crate::debug::{IterationRecord, RegistrationTrace};
use crate::error::Result;
use crate::types::{to_vectors, RegistrationResult, RegistrationStatus, RigidTransform};

/// Rotations further than this from orthonormal are re-projected onto SO(3).
const ORTHONORMALITY_TOLERANCE: f64 = 1e-9;

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Initializing,
    OuterIterating,
    Solving,
    CheckingConvergence,
    Converged,
    IterationLimitReached,
    Cancelled,
}

impl EnginePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnginePhase::Converged | EnginePhase::IterationLimitReached | EnginePhase::Cancelled
        )
    }

    fn status(&self) -> RegistrationStatus {
        match self {
            EnginePhase::Converged => RegistrationStatus::Converged,
            EnginePhase::IterationLimitReached => RegistrationStatus::IterationLimitReached,
            _ => RegistrationStatus::Cancelled,
        }
    }
}

/// What an observer wants after seeing an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    Continue,
    /// Cancel before the next outer iteration.
    Stop,
}

/// State exposed to observers after each outer iteration.
#[derive(Debug)]
pub struct IterationSnapshot<'a> {
    /// Outer iteration just completed (0-indexed).
    pub iteration: usize,
    pub transform: &'a RigidTransform,
    /// Source set under `transform`.
    pub transformed_source: &'a [Vector3<f64>],
    pub residual: f64,
    pub control: Option<f64>,
    /// Whether this iteration kept the previous transform.
    pub degenerate: bool,
}

/// Receives a snapshot after every outer iteration (a viewer, a logger).
///
/// Observers only read; the final transform is the same with or without one.
pub trait IterationObserver {
    fn on_iteration(&mut self, snapshot: &IterationSnapshot<'_>) -> ObserverAction;
}

impl<F> IterationObserver for F
where
    F: FnMut(&IterationSnapshot<'_>) -> ObserverAction,
{
    fn on_iteration(&mut self, snapshot: &IterationSnapshot<'_>) -> ObserverAction {
        self(snapshot)
    }
}

/// Drives one registration run.
pub struct RegistrationEngine {
    strategy: Box<dyn RegistrationStrategy>,
    convergence: ConvergenceConfig,

    /// Source set as given.
    source: Vec<Vector3<f64>>,
    /// Source set under the current transform.
    transformed: Vec<Vector3<f64>>,
    transform: RigidTransform,

    phase: EnginePhase,
    iteration: usize,
    last_residual: Option<f64>,
    last_change: Option<f64>,
    degenerate_iterations: usize,

    cancel: Option<Arc<AtomicBool>>,
    trace: RegistrationTrace,
    started: Option<Instant>,
}

impl RegistrationEngine {
    /// Validate inputs and parameters and set up the selected strategy.
    pub fn new(
        target: &[[f32; 3]],
        source: &[[f32; 3]],
        params: &RegistrationParameters,
    ) -> Result<Self> {
        Self::from_vectors(to_vectors(target), to_vectors(source), params)
    }

    pub fn from_vectors(
        target: Vec<Vector3<f64>>,
        source: Vec<Vector3<f64>>,
        params: &RegistrationParameters,
    ) -> Result<Self> {
        let num_target = target.len();
        let num_source = source.len();
        let strategy = build_strategy(params, target, source.clone())?;

        let mut trace = RegistrationTrace::new(strategy.name(), num_target, num_source);
        trace.backend = strategy.backend_name().map(str::to_string);
        trace.set_initial_transform(&RigidTransform::identity());

        debug!(
            algorithm = strategy.name(),
            backend = strategy.backend_name().unwrap_or("-"),
            num_target,
            num_source,
            iteration_bound = strategy.iteration_bound(),
            "Registration engine initialized"
        );

        Ok(Self {
            strategy,
            convergence: params.convergence.clone(),
            transformed: source.clone(),
            source,
            transform: RigidTransform::identity(),
            phase: EnginePhase::Initializing,
            iteration: 0,
            last_residual: None,
            last_change: None,
            degenerate_iterations: 0,
            cancel: None,
            trace,
            started: None,
        })
    }

    /// Start from `initial` instead of the identity. The rotation is projected
    /// onto SO(3) first.
    pub fn with_initial_transform(mut self, initial: RigidTransform) -> Self {
        let projected = if initial.is_proper_rotation(ORTHONORMALITY_TOLERANCE) {
            initial
        } else {
            initial.project_to_rotation()
        };
        self.set_transform(projected);
        self.trace.set_initial_transform(&projected);
        self
    }

    /// Stop before the next outer iteration once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Current (last valid) transform.
    pub fn transform(&self) -> &RigidTransform {
        &self.transform
    }

    /// Source set under the current transform.
    pub fn transformed_source(&self) -> &[Vector3<f64>] {
        &self.transformed
    }

    /// Number of completed outer iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn strategy(&self) -> &dyn RegistrationStrategy {
        self.strategy.as_ref()
    }

    /// Run one outer iteration, or settle into a terminal phase.
    ///
    /// Returns the phase after the step. Terminal phases are sticky.
    pub fn step(&mut self) -> Result<EnginePhase> {
        if self.phase.is_terminal() {
            return Ok(self.phase);
        }
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.phase = EnginePhase::OuterIterating;

        if self.cancel_requested() {
            self.finish(EnginePhase::Cancelled);
            return Ok(self.phase);
        }
        if self.schedule_done() {
            let phase = self.bound_phase();
            self.finish(phase);
            return Ok(self.phase);
        }

        let iteration_start = Instant::now();
        self.phase = EnginePhase::Solving;
        let outcome = self.strategy.iterate(&self.transform)?;

        let previous = self.transform;
        let mut record = IterationRecord::new(self.iteration, &previous);
        record.control = outcome.control;
        record.residual = outcome.residual;
        record.marginal_error = outcome.marginal_error;

        let change = match outcome.candidate {
            Ok(candidate) => {
                let candidate = if candidate.is_proper_rotation(ORTHONORMALITY_TOLERANCE) {
                    candidate
                } else {
                    warn!(
                        iteration = self.iteration,
                        error = candidate.orthonormality_error(),
                        "Re-orthonormalizing rotation"
                    );
                    candidate.project_to_rotation()
                };
                self.set_transform(candidate);
                Some(candidate.change_to(&previous))
            }
            Err(reason) => {
                warn!(
                    iteration = self.iteration,
                    algorithm = self.strategy.name(),
                    "Degenerate geometry, keeping previous transform: {reason}"
                );
                self.degenerate_iterations += 1;
                record.degenerate = true;
                record.degenerate_reason = Some(reason.to_string());
                None
            }
        };

        record.rotation = self.transform.rotation_row_major().to_vec();
        record.translation = self.transform.translation.iter().copied().collect();
        record.change = change.unwrap_or(0.0);
        record.elapsed_ms = iteration_start.elapsed().as_secs_f64() * 1000.0;
        self.trace.push(record);

        debug!(
            iteration = self.iteration,
            control = outcome.control,
            residual = outcome.residual,
            marginal_error = outcome.marginal_error,
            change,
            "Outer iteration"
        );

        let previous_residual = self.last_residual.replace(outcome.residual);
        self.last_change = change;
        self.iteration += 1;
        self.strategy.anneal();

        self.phase = EnginePhase::CheckingConvergence;
        if self.strategy.supports_early_stop() {
            if let Some(change) = change {
                let residual_settled = previous_residual.is_some_and(|prev| {
                    (prev - outcome.residual).abs() < self.convergence.residual_epsilon
                });
                if change < self.convergence.transformation_epsilon || residual_settled {
                    self.finish(EnginePhase::Converged);
                    return Ok(self.phase);
                }
            }
        }
        if self.schedule_done() {
            let phase = self.bound_phase();
            self.finish(phase);
            return Ok(self.phase);
        }

        self.phase = EnginePhase::OuterIterating;
        Ok(self.phase)
    }

    /// Run to a terminal phase.
    pub fn run(self) -> Result<RegistrationResult> {
        self.run_with_observer(&mut |_: &IterationSnapshot<'_>| ObserverAction::Continue)
    }

    /// Run to a terminal phase, showing every iteration to `observer`.
    pub fn run_with_observer(
        mut self,
        observer: &mut dyn IterationObserver,
    ) -> Result<RegistrationResult> {
        while !self.phase.is_terminal() {
            let before = self.iteration;
            self.step()?;
            if self.iteration == before {
                continue;
            }

            let Some(last) = self.trace.iterations.last() else {
                continue;
            };
            let snapshot = IterationSnapshot {
                iteration: last.iteration,
                transform: &self.transform,
                transformed_source: &self.transformed,
                residual: last.residual,
                control: last.control,
                degenerate: last.degenerate,
            };
            if observer.on_iteration(&snapshot) == ObserverAction::Stop
                && !self.phase.is_terminal()
            {
                self.finish(EnginePhase::Cancelled);
            }
        }
        Ok(self.into_result())
    }

    /// Result for the current state. A run stopped before a terminal phase
    /// reports `Cancelled`.
    pub fn into_result(mut self) -> RegistrationResult {
        if !self.phase.is_terminal() {
            self.finish(EnginePhase::Cancelled);
        }
        RegistrationResult {
            transform: self.transform,
            status: self.phase.status(),
            iterations: self.iteration,
            final_residual: self.last_residual.unwrap_or(0.0),
            degenerate_iterations: self.degenerate_iterations,
            trace: self.trace,
        }
    }

    fn set_transform(&mut self, transform: RigidTransform) {
        self.transform = transform;
        for (moved, y) in self.transformed.iter_mut().zip(&self.source) {
            *moved = transform.apply(y);
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn schedule_done(&self) -> bool {
        self.iteration >= self.strategy.iteration_bound() || self.strategy.is_exhausted()
    }

    /// Terminal phase once the iteration bound or schedule is used up.
    fn bound_phase(&self) -> EnginePhase {
        let settled = self
            .last_change
            .is_some_and(|c| c < self.convergence.transformation_epsilon);
        if settled && !self.strategy.supports_early_stop() {
            EnginePhase::Converged
        } else {
            EnginePhase::IterationLimitReached
        }
    }

    fn finish(&mut self, phase: EnginePhase) {
        self.phase = phase;
        let status = phase.status();
        self.trace.status = format!("{status:?}");
        self.trace.total_iterations = self.iteration;
        self.trace.degenerate_iterations = self.degenerate_iterations;
        self.trace.final_residual = self.last_residual.unwrap_or(0.0);
        self.trace.set_final_transform(&self.transform);
        self.trace.total_ms = self
            .started
            .map_or(0.0, |t| t.elapsed().as_secs_f64() * 1000.0);

        info!(
            algorithm = self.strategy.name(),
            status = ?status,
            iterations = self.iteration,
            residual = self.trace.final_residual,
            degenerate = self.degenerate_iterations,
            "Registration finished"
        );
    }
}

/// Register `source` onto `target` with `params`, starting from the identity.
pub fn register(
    target: &[[f32; 3]],
    source: &[[f32; 3]],
    params: &RegistrationParameters,
) -> Result<RegistrationResult> {
    RegistrationEngine::new(target, source, params)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, EmIcpBackendKind};
    use crate::error::RegistrationError;
    use crate::test_utils::{
        add_gaussian_noise, make_corner_planes, make_random_cloud, small_perturbation,
        transform_cloud,
    };
    use approx::assert_relative_eq;

    const ALL_ALGORITHMS: [Algorithm; 4] = [
        Algorithm::Icp,
        Algorithm::EmIcp,
        Algorithm::EmIcpCpu,
        Algorithm::Softassign,
    ];

    /// Parameters scaled to the unit-size synthetic clouds.
    fn test_params(algorithm: Algorithm) -> RegistrationParameters {
        let mut p = RegistrationParameters::for_algorithm(algorithm);
        p.icp.max_iteration = 100;
        p.em_icp.backend = EmIcpBackendKind::Parallel;
        p.softassign.t_0 = 0.5;
        p.softassign.t_factor = 0.9;
        p.softassign.jmax = 80;
        p.softassign.alpha = 0.05;
        p
    }

    fn assert_recovers(result: &RegistrationResult, expected: &RigidTransform, tol: f64) {
        assert_relative_eq!(result.transform.rotation, expected.rotation, epsilon = tol);
        assert_relative_eq!(result.transform.translation, expected.translation, epsilon = tol);
    }

    #[test]
    fn test_identity_case_all_algorithms() {
        let cloud = make_random_cloud(200, 61);
        for algorithm in ALL_ALGORITHMS {
            let result = register(&cloud, &cloud, &test_params(algorithm)).unwrap();
            assert!(result.status.is_complete(), "{algorithm:?}");
            assert_recovers(&result, &RigidTransform::identity(), 1e-4);
        }
    }

    #[test]
    fn test_recovers_inverse_of_applied_transform() {
        let target = make_random_cloud(300, 62);
        let applied = small_perturbation();
        let source = transform_cloud(&target, &applied);
        let expected = applied.inverse();

        for algorithm in ALL_ALGORITHMS {
            let result = register(&target, &source, &test_params(algorithm)).unwrap();
            assert!(result.status.is_complete(), "{algorithm:?}");
            assert_recovers(&result, &expected, 1e-3);
        }
    }

    #[test]
    fn test_recovers_under_noise() {
        let target = make_random_cloud(300, 75);
        let applied = small_perturbation();
        let source = add_gaussian_noise(&transform_cloud(&target, &applied), 0.002, 76);
        let expected = applied.inverse();

        for algorithm in ALL_ALGORITHMS {
            let result = register(&target, &source, &test_params(algorithm)).unwrap();
            assert!(result.status.is_complete(), "{algorithm:?}");
            assert_recovers(&result, &expected, 1e-2);
        }
    }

    #[test]
    fn test_annealed_algorithms_ignore_far_outliers() {
        let target = make_random_cloud(300, 77);
        let applied = small_perturbation();
        let mut source = transform_cloud(&target, &applied);
        source.extend(make_random_cloud(20, 78).iter().map(|p| [p[0] + 5.0, p[1], p[2]]));
        let expected = applied.inverse();

        for algorithm in [Algorithm::EmIcp, Algorithm::EmIcpCpu, Algorithm::Softassign] {
            let result = register(&target, &source, &test_params(algorithm)).unwrap();
            assert!(result.status.is_complete(), "{algorithm:?}");
            assert_eq!(result.degenerate_iterations, 0, "{algorithm:?}");
            assert_recovers(&result, &expected, 1e-2);
        }
    }

    #[test]
    fn test_icp_locks_onto_corner_planes() {
        let target = make_corner_planes(0.5, 0.05);
        let applied = RigidTransform::from_axis_angle(
            &Vector3::new(0.2, -0.4, 1.0),
            0.5f64.to_radians(),
            Vector3::new(0.005, -0.004, 0.003),
        );
        let source = transform_cloud(&target, &applied);
        let result = register(&target, &source, &test_params(Algorithm::Icp)).unwrap();

        assert_eq!(result.status, RegistrationStatus::Converged);
        assert!(result.iterations < 10);
        assert_recovers(&result, &applied.inverse(), 1e-4);
    }

    #[test]
    fn test_softassign_records_marginal_error() {
        let target = make_random_cloud(120, 79);
        let source = transform_cloud(&target, &small_perturbation());
        let mut params = test_params(Algorithm::Softassign);
        params.softassign.jmax = 10;
        let result = register(&target, &source, &params).unwrap();

        assert_eq!(result.trace.iterations.len(), 10);
        for record in &result.trace.iterations {
            let error = record.marginal_error.unwrap();
            assert!(error.is_finite() && error >= 0.0);
            assert!(error < 0.5);
        }

        let icp = register(&target, &source, &test_params(Algorithm::Icp)).unwrap();
        assert!(icp.trace.iterations.iter().all(|r| r.marginal_error.is_none()));
    }

    #[test]
    fn test_rotation_stays_orthonormal_every_iteration() {
        let target = make_random_cloud(150, 63);
        let source = transform_cloud(&target, &small_perturbation());

        for algorithm in ALL_ALGORITHMS {
            let mut observer = |s: &IterationSnapshot<'_>| {
                assert!(s.transform.orthonormality_error() < 1e-9, "{algorithm:?}");
                assert_relative_eq!(s.transform.determinant(), 1.0, epsilon = 1e-9);
                ObserverAction::Continue
            };
            let engine = RegistrationEngine::new(&target, &source, &test_params(algorithm)).unwrap();
            let result = engine.run_with_observer(&mut observer).unwrap();

            for record in &result.trace.iterations {
                let mut rotation = [0.0; 9];
                rotation.copy_from_slice(&record.rotation);
                let t = RigidTransform::from_row_major(&rotation, &[0.0; 3]);
                assert!(t.is_proper_rotation(1e-9));
            }
        }
    }

    #[test]
    fn test_icp_residual_non_increasing() {
        let target = make_random_cloud(300, 64);
        let source = transform_cloud(&target, &small_perturbation());
        let result = register(&target, &source, &test_params(Algorithm::Icp)).unwrap();

        let residuals = result.trace.residuals();
        assert!(residuals.len() >= 2);
        for pair in residuals.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12, "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_emicp_serial_and_parallel_agree_every_iteration() {
        let target = make_random_cloud(200, 65);
        let source = transform_cloud(&target, &small_perturbation());

        let serial = register(&target, &source, &test_params(Algorithm::EmIcpCpu)).unwrap();
        let parallel = register(&target, &source, &test_params(Algorithm::EmIcp)).unwrap();

        assert_eq!(serial.trace.backend.as_deref(), Some("serial"));
        assert_eq!(parallel.trace.backend.as_deref(), Some("parallel"));
        assert_eq!(serial.iterations, parallel.iterations);
        for (a, b) in serial.trace.iterations.iter().zip(&parallel.trace.iterations) {
            for (x, y) in a.rotation.iter().zip(&b.rotation) {
                assert!((x - y).abs() < 1e-4);
            }
            for (x, y) in a.translation.iter().zip(&b.translation) {
                assert!((x - y).abs() < 1e-4);
            }
        }
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn test_emicp_cuda_matches_serial() {
        if !crate::correspondence::emicp::gpu::is_cuda_available() {
            eprintln!("Skipping test: CUDA not available");
            return;
        }
        let target = make_random_cloud(200, 66);
        let source = transform_cloud(&target, &small_perturbation());

        let mut cuda_params = test_params(Algorithm::EmIcp);
        cuda_params.em_icp.backend = EmIcpBackendKind::Cuda;
        let serial = register(&target, &source, &test_params(Algorithm::EmIcpCpu)).unwrap();
        let cuda = register(&target, &source, &cuda_params).unwrap();

        assert_eq!(cuda.trace.backend.as_deref(), Some("cuda"));
        for (a, b) in serial.trace.iterations.iter().zip(&cuda.trace.iterations) {
            for (x, y) in a.rotation.iter().zip(&b.rotation) {
                assert!((x - y).abs() < 1e-4);
            }
            for (x, y) in a.translation.iter().zip(&b.translation) {
                assert!((x - y).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_observer_does_not_change_result() {
        let target = make_random_cloud(150, 67);
        let source = transform_cloud(&target, &small_perturbation());
        let params = test_params(Algorithm::Softassign);

        let plain = register(&target, &source, &params).unwrap();
        let mut seen = 0;
        let mut observer = |s: &IterationSnapshot<'_>| {
            assert_eq!(s.transformed_source.len(), 150);
            seen += 1;
            ObserverAction::Continue
        };
        let observed = RegistrationEngine::new(&target, &source, &params)
            .unwrap()
            .run_with_observer(&mut observer)
            .unwrap();

        assert_eq!(seen, observed.iterations);
        assert_eq!(plain.transform, observed.transform);
        assert_eq!(plain.status, observed.status);
    }

    #[test]
    fn test_observer_stop_cancels_between_iterations() {
        let target = make_random_cloud(100, 68);
        let source = transform_cloud(&target, &small_perturbation());

        let mut observer = |s: &IterationSnapshot<'_>| {
            if s.iteration == 2 {
                ObserverAction::Stop
            } else {
                ObserverAction::Continue
            }
        };
        let result = RegistrationEngine::new(&target, &source, &test_params(Algorithm::EmIcpCpu))
            .unwrap()
            .run_with_observer(&mut observer)
            .unwrap();

        assert_eq!(result.status, RegistrationStatus::Cancelled);
        assert_eq!(result.iterations, 3);
        assert!(result.transform.is_proper_rotation(1e-9));
    }

    #[test]
    fn test_cancel_flag_set_before_run() {
        let cloud = make_random_cloud(50, 69);
        let flag = Arc::new(AtomicBool::new(true));
        let result = RegistrationEngine::new(&cloud, &cloud, &test_params(Algorithm::Icp))
            .unwrap()
            .with_cancel_flag(flag)
            .run()
            .unwrap();
        assert_eq!(result.status, RegistrationStatus::Cancelled);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.transform, RigidTransform::identity());
    }

    #[test]
    fn test_step_walks_state_machine() {
        let cloud = make_random_cloud(50, 70);
        let mut params = test_params(Algorithm::Softassign);
        params.softassign.jmax = 3;
        let mut engine = RegistrationEngine::new(&cloud, &cloud, &params).unwrap();
        assert_eq!(engine.phase(), EnginePhase::Initializing);

        assert_eq!(engine.step().unwrap(), EnginePhase::OuterIterating);
        assert_eq!(engine.step().unwrap(), EnginePhase::OuterIterating);
        let last = engine.step().unwrap();
        assert!(last.is_terminal());
        assert_eq!(engine.iteration(), 3);
        // terminal phases are sticky
        assert_eq!(engine.step().unwrap(), last);
        assert_eq!(engine.iteration(), 3);
    }

    #[test]
    fn test_icp_iteration_limit_reported() {
        let target = make_random_cloud(200, 71);
        let source = transform_cloud(&target, &small_perturbation());
        let mut params = test_params(Algorithm::Icp);
        params.icp.max_iteration = 1;
        let result = register(&target, &source, &params).unwrap();
        assert_eq!(result.status, RegistrationStatus::IterationLimitReached);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_icp_identity_converges_early() {
        let cloud = make_random_cloud(100, 72);
        let result = register(&cloud, &cloud, &test_params(Algorithm::Icp)).unwrap();
        assert_eq!(result.status, RegistrationStatus::Converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_degenerate_iterations_keep_previous_transform() {
        // Collinear sets: every pose solve is rank-deficient.
        let line: Vec<[f32; 3]> = (0..20).map(|i| [i as f32 * 0.1, 0.0, 0.0]).collect();
        let mut params = test_params(Algorithm::Icp);
        params.icp.max_iteration = 5;
        let initial = RigidTransform::new(nalgebra::Matrix3::identity(), Vector3::new(0.0, 0.01, 0.0));
        let result = RegistrationEngine::new(&line, &line, &params)
            .unwrap()
            .with_initial_transform(initial)
            .run()
            .unwrap();

        assert_eq!(result.degenerate_iterations, 5);
        assert_eq!(result.status, RegistrationStatus::IterationLimitReached);
        assert_eq!(result.transform, initial);
        assert!(result.trace.iterations.iter().all(|r| r.degenerate));
    }

    #[test]
    fn test_two_point_sets_are_degenerate_not_invalid() {
        let pair = [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0]];
        for algorithm in ALL_ALGORITHMS {
            let engine = RegistrationEngine::new(&pair, &pair, &test_params(algorithm)).unwrap();
            let bound = engine.strategy().iteration_bound();
            let result = engine.run().unwrap();

            assert_eq!(result.status, RegistrationStatus::IterationLimitReached, "{algorithm:?}");
            assert_eq!(result.iterations, bound, "{algorithm:?}");
            assert_eq!(result.degenerate_iterations, bound, "{algorithm:?}");
            assert_eq!(result.transform, RigidTransform::identity());
        }
    }

    #[test]
    fn test_initial_transform_is_projected() {
        let cloud = make_random_cloud(50, 73);
        let mut skewed = RigidTransform::from_axis_angle(&Vector3::z(), 0.1, Vector3::zeros());
        skewed.rotation[(0, 1)] += 0.01;
        let engine = RegistrationEngine::new(&cloud, &cloud, &test_params(Algorithm::Icp))
            .unwrap()
            .with_initial_transform(skewed);
        assert!(engine.transform().is_proper_rotation(1e-9));
        assert_eq!(engine.transformed_source().len(), 50);
    }

    #[test]
    fn test_empty_input_rejected_before_running() {
        let cloud = make_random_cloud(10, 74);
        for algorithm in ALL_ALGORITHMS {
            let err = register(&[], &cloud, &test_params(algorithm)).err();
            assert!(matches!(err, Some(RegistrationError::InvalidInput(_))));
        }
    }

    #[test]
    fn test_trace_summary_filled() {
        let cloud = make_random_cloud(60, 75);
        let result = register(&cloud, &cloud, &test_params(Algorithm::EmIcpCpu)).unwrap();
        assert_eq!(result.trace.algorithm, "emicp-cpu");
        assert_eq!(result.trace.total_iterations, result.iterations);
        assert_eq!(result.trace.iterations.len(), result.iterations);
        assert_eq!(result.iterations, 66);
        assert!(result.trace.to_json().is_ok());
    }
}
