//! Core value types: rigid transforms, point conversion and run results.

use std::fmt;

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::debug::RegistrationTrace;

/// A rigid transform `y ↦ R·y + t`.
///
/// The rotation is kept as a plain 3×3 matrix so the persisted row-major
/// layout maps one to one. Transforms produced by the engine are always
/// proper rotations (orthonormal, det = +1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    /// 3×3 rotation matrix R.
    pub rotation: Matrix3<f64>,

    /// Translation vector t.
    pub translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// Identity rotation, zero translation.
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from 9 row-major rotation values and 3 translation values.
    pub fn from_row_major(rotation: &[f64; 9], translation: &[f64; 3]) -> Self {
        Self {
            rotation: Matrix3::from_row_slice(rotation),
            translation: Vector3::new(translation[0], translation[1], translation[2]),
        }
    }

    /// Rotation entries in row-major order.
    pub fn rotation_row_major(&self) -> [f64; 9] {
        let r = &self.rotation;
        [
            r[(0, 0)],
            r[(0, 1)],
            r[(0, 2)],
            r[(1, 0)],
            r[(1, 1)],
            r[(1, 2)],
            r[(2, 0)],
            r[(2, 1)],
            r[(2, 2)],
        ]
    }

    /// Build from an axis-angle rotation and a translation.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64, translation: Vector3<f64>) -> Self {
        let rotation = Rotation3::from_scaled_axis(axis.normalize() * angle);
        Self {
            rotation: *rotation.matrix(),
            translation,
        }
    }

    /// Apply the transform to a single point.
    #[inline]
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Apply the transform to every point of a set.
    pub fn apply_all(&self, points: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        points.iter().map(|p| self.apply(p)).collect()
    }

    /// `self ∘ other`: first `other`, then `self`.
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform `x ↦ Rᵀ·(x − t)`.
    pub fn inverse(&self) -> RigidTransform {
        let rt = self.rotation.transpose();
        RigidTransform {
            rotation: rt,
            translation: -(rt * self.translation),
        }
    }

    /// Frobenius norm of `R·Rᵀ − I`.
    pub fn orthonormality_error(&self) -> f64 {
        (self.rotation * self.rotation.transpose() - Matrix3::identity()).norm()
    }

    pub fn determinant(&self) -> f64 {
        self.rotation.determinant()
    }

    /// Whether R is orthonormal with det ≈ +1 within `tolerance`.
    pub fn is_proper_rotation(&self, tolerance: f64) -> bool {
        self.orthonormality_error() < tolerance && (self.determinant() - 1.0).abs() < tolerance
    }

    /// Nearest proper rotation (in Frobenius norm) with the same translation.
    ///
    /// Uses `R = U·diag(1, 1, det(U·Vᵀ))·Vᵀ` from the SVD of the stored matrix.
    pub fn project_to_rotation(&self) -> RigidTransform {
        let svd = self.rotation.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return RigidTransform::identity();
        };
        let mut correction = Matrix3::identity();
        if (u * v_t).determinant() < 0.0 {
            correction[(2, 2)] = -1.0;
        }
        // singular values from nalgebra are sorted in decreasing order, so the
        // sign flip lands on the weakest direction
        RigidTransform {
            rotation: u * correction * v_t,
            translation: self.translation,
        }
    }

    /// Geodesic angle (radians) between this rotation and `other`'s.
    ///
    /// Uses `atan2(sin, cos)` of the relative rotation so tiny angles are not
    /// lost to rounding in the trace.
    pub fn rotation_angle_to(&self, other: &RigidTransform) -> f64 {
        let q = self.rotation.transpose() * other.rotation;
        let sin = 0.5
            * Vector3::new(
                q[(2, 1)] - q[(1, 2)],
                q[(0, 2)] - q[(2, 0)],
                q[(1, 0)] - q[(0, 1)],
            )
            .norm();
        let cos = (q.trace() - 1.0) * 0.5;
        sin.atan2(cos)
    }

    pub fn translation_distance_to(&self, other: &RigidTransform) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Combined change measure used for convergence checks:
    /// rotation angle plus translation distance.
    pub fn change_to(&self, other: &RigidTransform) -> f64 {
        self.rotation_angle_to(other) + self.translation_distance_to(other)
    }
}

impl fmt::Display for RigidTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "R")?;
        for row in 0..3 {
            for col in 0..3 {
                write!(f, "{:.6} ", self.rotation[(row, col)])?;
            }
            writeln!(f)?;
        }
        writeln!(f, "t")?;
        for i in 0..3 {
            write!(f, "{:.6} ", self.translation[i])?;
        }
        Ok(())
    }
}

/// Convert single-precision points to the f64 vectors used internally.
pub fn to_vectors(points: &[[f32; 3]]) -> Vec<Vector3<f64>> {
    points
        .iter()
        .map(|p| Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect()
}

/// How a registration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// Change in transform (or residual) fell below the configured threshold.
    Converged,

    /// Iteration bound (or annealing schedule) exhausted without meeting the threshold.
    IterationLimitReached,

    /// Stopped between outer iterations by an observer or the cancel flag.
    Cancelled,
}

impl RegistrationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, RegistrationStatus::Converged)
    }

    /// Whether the run reached a terminal state on its own (not cancelled).
    pub fn is_complete(&self) -> bool {
        !matches!(self, RegistrationStatus::Cancelled)
    }
}

/// Result of a registration run.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Last valid transform mapping source onto target.
    pub transform: RigidTransform,

    pub status: RegistrationStatus,

    /// Number of outer iterations performed.
    pub iterations: usize,

    /// Residual reported by the last iteration (mean squared correspondence distance).
    pub final_residual: f64,

    /// Number of iterations whose pose update was rejected as degenerate.
    pub degenerate_iterations: usize,

    /// Per-iteration history.
    pub trace: RegistrationTrace,
}
