//! Softassign: deterministic annealing over a doubly-stochastic assignment.
//!
//! The augmented (Ny+1)×(Nx+1) matrix has one row per source point, one
//! column per target point, plus a slack row and column that absorb
//! outliers:
//!
//! ```text
//! mᵢⱼ = exp((α − dᵢⱼ²) / T)     real entries
//! mᵢ,Nx = m_Ny,ⱼ = moutlier     slack entries
//! ```
//!
//! Sinkhorn passes alternately normalize the real rows (over all Nx+1
//! columns) and the real columns (over all Ny+1 rows). Real rows are filled
//! in the log domain shifted by their maximum; the first row normalization
//! removes that factor exactly, so tiny temperatures cannot overflow.

use nalgebra::Vector3;
use rayon::prelude::*;

use super::{RegistrationStrategy, StepOutcome};
use crate::annealing::AnnealingSchedule;
use crate::config::SoftassignConfig;
use crate::error::Result;
use crate::pose::{soft_residual, solve_soft_matches, DegenerateGeometry, SoftMatch};
use crate::types::RigidTransform;

/// Outcome of one Sinkhorn balancing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkhornStats {
    /// Row-then-column passes performed.
    pub passes: usize,

    /// Largest |sum − 1| over the real rows and columns after the last pass.
    pub marginal_error: f64,
}

/// Dense augmented assignment matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentMatrix {
    /// Real rows (source points).
    rows: usize,
    /// Real columns (target points).
    cols: usize,
    /// (rows + 1) × (cols + 1) entries.
    data: Vec<f64>,
}

impl AssignmentMatrix {
    /// Build from point sets: rows are `moved_source`, columns are `target`.
    pub fn from_points(
        target: &[Vector3<f64>],
        moved_source: &[Vector3<f64>],
        temperature: f64,
        alpha: f64,
        moutlier: f64,
    ) -> Self {
        let (rows, cols) = (moved_source.len(), target.len());
        let mut matrix = Self::with_slack(rows, cols, moutlier);
        let stride = cols + 1;
        let log_slack = moutlier.ln();

        matrix.data[..rows * stride]
            .par_chunks_mut(stride)
            .zip(moved_source.par_iter())
            .for_each(|(row, y)| {
                let d2 = target.iter().map(|x| (x - y).norm_squared());
                fill_row(row, d2, temperature, alpha, log_slack);
            });

        matrix
    }

    fn with_slack(rows: usize, cols: usize, moutlier: f64) -> Self {
        let stride = cols + 1;
        let mut data = vec![0.0; (rows + 1) * stride];
        for j in 0..cols {
            data[rows * stride + j] = moutlier;
        }
        Self { rows, cols, data }
    }

    /// Number of real rows and columns.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Entry (i, j); `i == rows` or `j == cols` addresses the slack.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * (self.cols + 1) + j]
    }

    /// Sum of real row `i` over all Nx+1 columns.
    pub fn row_sum(&self, i: usize) -> f64 {
        let stride = self.cols + 1;
        self.data[i * stride..(i + 1) * stride].iter().sum()
    }

    /// Sum of real column `j` over all Ny+1 rows.
    pub fn column_sum(&self, j: usize) -> f64 {
        let stride = self.cols + 1;
        (0..=self.rows).map(|i| self.data[i * stride + j]).sum()
    }

    /// Largest |sum − 1| over all real rows and columns.
    pub fn max_marginal_error(&self) -> f64 {
        let stride = self.cols + 1;
        let row_err = self.data[..self.rows * stride]
            .par_chunks(stride)
            .map(|row| (row.iter().sum::<f64>() - 1.0).abs())
            .reduce(|| 0.0, f64::max);
        let col_err = self
            .column_sums()
            .iter()
            .map(|s| (s - 1.0).abs())
            .fold(0.0, f64::max);
        row_err.max(col_err)
    }

    fn column_sums(&self) -> Vec<f64> {
        let stride = self.cols + 1;
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks_exact(stride) {
            for (s, v) in sums.iter_mut().zip(row) {
                *s += v;
            }
        }
        sums
    }

    /// Sinkhorn balancing: up to `max_passes` row-then-column passes,
    /// stopping early once every real marginal is within `epsilon` of 1.
    ///
    /// Column sums are exact after every pass, so the reported error is the
    /// residual row deviation.
    pub fn normalize(&mut self, max_passes: usize, epsilon: f64) -> SinkhornStats {
        let stride = self.cols + 1;
        let rows = self.rows;
        let mut stats = SinkhornStats {
            passes: 0,
            marginal_error: self.max_marginal_error(),
        };

        for pass in 1..=max_passes {
            self.data[..rows * stride]
                .par_chunks_mut(stride)
                .for_each(|row| {
                    let sum: f64 = row.iter().sum();
                    if sum > 0.0 {
                        row.iter_mut().for_each(|v| *v /= sum);
                    }
                });

            let sums = self.column_sums();
            for row in self.data.chunks_exact_mut(stride) {
                for (v, s) in row.iter_mut().zip(&sums) {
                    if *s > 0.0 {
                        *v /= s;
                    }
                }
            }

            stats = SinkhornStats {
                passes: pass,
                marginal_error: self.max_marginal_error(),
            };
            if stats.marginal_error < epsilon {
                break;
            }
        }
        stats
    }

    /// Collapse each real row into its inlier mass and weighted target mean.
    pub fn soft_matches(&self, target: &[Vector3<f64>]) -> Vec<SoftMatch> {
        debug_assert_eq!(target.len(), self.cols);
        let stride = self.cols + 1;
        self.data[..self.rows * stride]
            .par_chunks(stride)
            .map(|row| {
                let mut mass = 0.0;
                let mut sum = Vector3::zeros();
                for (w, x) in row[..self.cols].iter().zip(target) {
                    mass += w;
                    sum += x * *w;
                }
                SoftMatch::from_weighted_sum(mass, sum)
            })
            .collect()
    }
}

/// Fill one real row from squared distances, shifted by the row maximum.
fn fill_row(
    row: &mut [f64],
    squared_distances: impl Iterator<Item = f64> + Clone,
    temperature: f64,
    alpha: f64,
    log_slack: f64,
) {
    let inv_t = 1.0 / temperature;
    let shift = squared_distances
        .clone()
        .map(|d2| (alpha - d2) * inv_t)
        .fold(log_slack, f64::max);

    let (real, slack) = row.split_at_mut(row.len() - 1);
    for (v, d2) in real.iter_mut().zip(squared_distances) {
        *v = ((alpha - d2) * inv_t - shift).exp();
    }
    slack[0] = (log_slack - shift).exp();
}

/// Softassign strategy.
///
/// Each outer iteration runs `I1` assignment passes at the current
/// temperature; every pass rebuilds the matrix under the latest pose,
/// balances it with up to `I0` Sinkhorn passes and re-solves the pose. The
/// pose after the last pass is the iteration's candidate.
pub struct SoftassignStrategy {
    target: Vec<Vector3<f64>>,
    source: Vec<Vector3<f64>>,
    schedule: AnnealingSchedule,
    i0: usize,
    i1: usize,
    alpha: f64,
    moutlier: f64,
    sinkhorn_epsilon: f64,
}

impl SoftassignStrategy {
    pub fn new(
        target: Vec<Vector3<f64>>,
        source: Vec<Vector3<f64>>,
        config: &SoftassignConfig,
    ) -> Self {
        Self {
            target,
            source,
            schedule: AnnealingSchedule::new(config.t_0, config.t_factor, config.jmax)
                .floor(config.t_min),
            i0: config.i0,
            i1: config.i1,
            alpha: config.alpha,
            moutlier: config.effective_moutlier(),
            sinkhorn_epsilon: config.sinkhorn_epsilon,
        }
    }

    pub fn schedule(&self) -> &AnnealingSchedule {
        &self.schedule
    }

    /// Balanced assignment matrix for `pose` at the current temperature.
    pub fn assignment(&self, pose: &RigidTransform) -> (AssignmentMatrix, SinkhornStats) {
        let moved = pose.apply_all(&self.source);
        let mut matrix = AssignmentMatrix::from_points(
            &self.target,
            &moved,
            self.schedule.current(),
            self.alpha,
            self.moutlier,
        );
        let stats = matrix.normalize(self.i0, self.sinkhorn_epsilon);
        (matrix, stats)
    }
}

impl RegistrationStrategy for SoftassignStrategy {
    fn name(&self) -> &'static str {
        "softassign"
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
        let temperature = self.schedule.current();
        let mut pose = *current;
        let mut solved = false;
        let mut failure: Option<DegenerateGeometry> = None;
        let mut matches = Vec::new();
        let mut marginal_error = None;

        for _ in 0..self.i1 {
            let (matrix, stats) = self.assignment(&pose);
            marginal_error = Some(stats.marginal_error);
            matches = matrix.soft_matches(&self.target);

            match solve_soft_matches(&self.source, &matches) {
                Ok(next) => {
                    pose = next;
                    solved = true;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let candidate = match failure {
            Some(e) if !solved => Err(e),
            _ => Ok(pose),
        };
        let residual = soft_residual(&self.source, &matches, &pose);

        Ok(StepOutcome {
            candidate,
            residual,
            control: Some(temperature),
            marginal_error,
        })
    }

    fn anneal(&mut self) {
        self.schedule.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_random_cloud, small_perturbation, transform_cloud};
    use crate::types::to_vectors;
    use approx::assert_relative_eq;

    #[test]
    fn test_sinkhorn_reaches_doubly_stochastic() {
        let target = to_vectors(&make_random_cloud(60, 51));
        let source = to_vectors(&transform_cloud(&make_random_cloud(60, 51), &small_perturbation()));
        for temperature in [1.0, 0.05, 0.01] {
            let mut m = AssignmentMatrix::from_points(&target, &source, temperature, 0.05, 0.3);
            // slack row mass only decays like 1/passes
            m.normalize(5000, 1e-9);
            for i in 0..60 {
                assert_relative_eq!(m.row_sum(i), 1.0, epsilon = 2e-3);
            }
            for j in 0..60 {
                assert_relative_eq!(m.column_sum(j), 1.0, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_normalize_stops_early() {
        let target = to_vectors(&make_random_cloud(30, 52));
        let mut m = AssignmentMatrix::from_points(&target, &target, 0.1, 0.05, 0.3);
        let stats = m.normalize(10_000, 1e-3);
        assert!(stats.passes < 10_000);
        assert!(stats.marginal_error < 1e-3);
        assert_relative_eq!(stats.marginal_error, m.max_marginal_error());
    }

    #[test]
    fn test_entries_finite_at_tiny_temperature() {
        let target = to_vectors(&make_random_cloud(40, 53));
        let source = to_vectors(&make_random_cloud(40, 54));
        let m = AssignmentMatrix::from_points(&target, &source, 1e-12, 3.0, 0.1);
        let (rows, cols) = m.shape();
        for i in 0..=rows {
            for j in 0..=cols {
                let v = m.get(i, j);
                assert!(v.is_finite() && v >= 0.0);
            }
        }
    }

    #[test]
    fn test_far_source_row_goes_to_slack() {
        let target = to_vectors(&make_random_cloud(20, 57));
        let mut source = target.clone();
        source.push(Vector3::new(10.0, 10.0, 10.0));
        let mut m = AssignmentMatrix::from_points(&target, &source, 0.01, 0.05, 0.3);
        m.normalize(500, 1e-9);
        let far = source.len() - 1;
        assert!(m.get(far, 20) > 0.99);

        let matches = m.soft_matches(&target);
        assert_eq!(matches[far].mass, 0.0);
    }

    #[test]
    fn test_cold_assignment_is_near_permutation() {
        let target = to_vectors(&make_random_cloud(50, 58));
        let mut m = AssignmentMatrix::from_points(&target, &target, 1e-6, 0.05, 0.3);
        m.normalize(50, 1e-6);
        for i in 0..50 {
            assert!(m.get(i, i) > 0.9);
            for j in (0..50).filter(|&j| j != i) {
                assert!(m.get(i, j) < 1e-6);
            }
        }
        let matches = m.soft_matches(&target);
        for (x, sm) in target.iter().zip(&matches) {
            assert_relative_eq!(sm.target_mean, *x, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_schedule_bound_is_jmax() {
        let cloud = to_vectors(&make_random_cloud(10, 59));
        let s = SoftassignStrategy::new(cloud.clone(), cloud, &SoftassignConfig::default());
        assert_eq!(s.iteration_bound(), 100);
        assert_eq!(s.control(), Some(100.0));

        let config = SoftassignConfig {
            t_min: Some(50.0),
            ..Default::default()
        };
        let cloud = to_vectors(&make_random_cloud(10, 59));
        let s = SoftassignStrategy::new(cloud.clone(), cloud, &config);
        // 100 * 0.95^14 ≈ 48.8
        assert_eq!(s.iteration_bound(), 14);
    }

    #[test]
    fn test_marginal_error_shrinks_with_more_passes() {
        let target = to_vectors(&make_random_cloud(60, 60));
        let source = to_vectors(&transform_cloud(&make_random_cloud(60, 60), &small_perturbation()));
        let errors: Vec<f64> = [1, 5, 50, 500]
            .into_iter()
            .map(|passes| {
                let mut m = AssignmentMatrix::from_points(&target, &source, 0.05, 0.05, 0.3);
                let stats = m.normalize(passes, 0.0);
                assert_eq!(stats.passes, passes);
                for j in 0..60 {
                    assert_relative_eq!(m.column_sum(j), 1.0, epsilon = 1e-12);
                }
                stats.marginal_error
            })
            .collect();
        assert!(errors.iter().all(|e| e.is_finite()));
        assert!(errors[3] < errors[0]);
    }

    #[test]
    fn test_iteration_reports_marginal_error() {
        let target = to_vectors(&make_random_cloud(80, 61));
        let source = to_vectors(&transform_cloud(&make_random_cloud(80, 61), &small_perturbation()));
        let loose = SoftassignConfig {
            t_0: 0.5,
            alpha: 0.05,
            i0: 5,
            i1: 1,
            sinkhorn_epsilon: 1e-12,
            ..Default::default()
        };
        let tight = SoftassignConfig { i0: 500, ..loose.clone() };

        let identity = RigidTransform::identity();
        let mut s = SoftassignStrategy::new(target.clone(), source.clone(), &loose);
        let loose_error = s.iterate(&identity).unwrap().marginal_error.unwrap();
        let mut s = SoftassignStrategy::new(target, source, &tight);
        let tight_error = s.iterate(&identity).unwrap().marginal_error.unwrap();

        assert!(loose_error.is_finite());
        assert!(tight_error < loose_error);
        assert!(tight_error < 0.1);
    }
}
