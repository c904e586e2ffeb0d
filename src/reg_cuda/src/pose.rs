//! Closed-form pose solving (absolute orientation).
//!
//! Given weighted pairs {(xᵢ, yᵢ, wᵢ)}, finds the rigid transform minimizing
//! `Σ wᵢ‖xᵢ − (R·yᵢ + t)‖²`:
//! 1. Weighted centroids x̄, ȳ
//! 2. Cross-covariance H = Σ wᵢ (yᵢ − ȳ)(xᵢ − x̄)ᵀ
//! 3. SVD H = U·Σ·Vᵀ, R = V·Uᵀ
//! 4. If det(R) < 0, flip the column of V belonging to the smallest singular value
//! 5. t = x̄ − R·ȳ
//!
//! Soft correspondences (EM-ICP, Softassign) are first collapsed per source
//! point into a row mass λᵢ and a weighted target mean x̄ᵢ; solving with the
//! pairs (x̄ᵢ, yᵢ, λᵢ) gives the same optimum as the full double sum.

use std::fmt;

use nalgebra::{Matrix3, Vector3};

use crate::types::RigidTransform;

/// Total weight below which a correspondence set carries no information.
pub const MIN_TOTAL_WEIGHT: f64 = 1e-12;

/// Largest singular value below which H is treated as zero.
pub const MIN_SINGULAR_VALUE: f64 = 1e-12;

/// Ratio s₂/s₁ below which H is treated as rank ≤ 1 (collinear / coincident points).
pub const RANK_RATIO_TOLERANCE: f64 = 1e-9;

/// A single weighted correspondence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedPair {
    /// Point in the target set X.
    pub target: Vector3<f64>,
    /// Point in the (untransformed) source set Y.
    pub source: Vector3<f64>,
    /// Nonnegative weight.
    pub weight: f64,
}

impl WeightedPair {
    pub fn new(target: Vector3<f64>, source: Vector3<f64>, weight: f64) -> Self {
        Self {
            target,
            source,
            weight,
        }
    }
}

/// Collapsed soft correspondence row for one source point.
///
/// `mass` is Σⱼ wᵢⱼ over real targets (outlier mass excluded) and
/// `target_mean` is Σⱼ wᵢⱼ·xⱼ / mass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftMatch {
    pub mass: f64,
    pub target_mean: Vector3<f64>,
}

impl SoftMatch {
    /// A row with no inlier mass (all weight went to the outlier bucket).
    pub fn empty() -> Self {
        Self {
            mass: 0.0,
            target_mean: Vector3::zeros(),
        }
    }

    /// Build from the raw weighted sum Σⱼ wᵢⱼ·xⱼ and its mass.
    pub fn from_weighted_sum(mass: f64, weighted_sum: Vector3<f64>) -> Self {
        if mass > MIN_TOTAL_WEIGHT {
            Self {
                mass,
                target_mean: weighted_sum / mass,
            }
        } else {
            Self::empty()
        }
    }
}

/// Why the weighted cross-covariance could not yield a unique rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DegenerateGeometry {
    /// Sum of weights is zero (or not finite).
    InsufficientWeight { total_weight: f64 },

    /// H has rank ≤ 1: collinear or coincident points.
    RankDeficient { singular_values: [f64; 3] },

    /// SVD did not produce U and V.
    DecompositionFailed,
}

impl fmt::Display for DegenerateGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientWeight { total_weight } => {
                write!(f, "insufficient correspondence weight ({total_weight:e})")
            }
            Self::RankDeficient { singular_values } => write!(
                f,
                "rank-deficient cross-covariance (singular values {:e}, {:e}, {:e})",
                singular_values[0], singular_values[1], singular_values[2]
            ),
            Self::DecompositionFailed => write!(f, "SVD of cross-covariance failed"),
        }
    }
}

impl std::error::Error for DegenerateGeometry {}

/// Solve for the rigid transform best aligning weighted pairs.
pub fn solve_absolute_orientation(
    pairs: &[WeightedPair],
) -> Result<RigidTransform, DegenerateGeometry> {
    let total_weight: f64 = pairs.iter().map(|p| p.weight).sum();
    if !(total_weight > MIN_TOTAL_WEIGHT) || !total_weight.is_finite() {
        return Err(DegenerateGeometry::InsufficientWeight { total_weight });
    }

    let mut target_centroid = Vector3::zeros();
    let mut source_centroid = Vector3::zeros();
    for p in pairs {
        target_centroid += p.target * p.weight;
        source_centroid += p.source * p.weight;
    }
    target_centroid /= total_weight;
    source_centroid /= total_weight;

    let mut h = Matrix3::zeros();
    for p in pairs {
        let ys = p.source - source_centroid;
        let xs = p.target - target_centroid;
        h += ys * xs.transpose() * p.weight;
    }

    let rotation = rotation_from_covariance(&h)?;
    let translation = target_centroid - rotation * source_centroid;

    Ok(RigidTransform {
        rotation,
        translation,
    })
}

/// Solve from collapsed soft rows: `matches[i]` belongs to `source[i]`.
pub fn solve_soft_matches(
    source: &[Vector3<f64>],
    matches: &[SoftMatch],
) -> Result<RigidTransform, DegenerateGeometry> {
    debug_assert_eq!(source.len(), matches.len());
    let pairs: Vec<WeightedPair> = source
        .iter()
        .zip(matches)
        .filter(|(_, m)| m.mass > 0.0)
        .map(|(y, m)| WeightedPair::new(m.target_mean, *y, m.mass))
        .collect();
    solve_absolute_orientation(&pairs)
}

/// Weighted mean squared distance `Σ λᵢ‖x̄ᵢ − T(yᵢ)‖² / Σ λᵢ` of soft rows under `transform`.
pub fn soft_residual(
    source: &[Vector3<f64>],
    matches: &[SoftMatch],
    transform: &RigidTransform,
) -> f64 {
    let mut sum = 0.0;
    let mut mass = 0.0;
    for (y, m) in source.iter().zip(matches) {
        if m.mass > 0.0 {
            sum += m.mass * (m.target_mean - transform.apply(y)).norm_squared();
            mass += m.mass;
        }
    }
    if mass > MIN_TOTAL_WEIGHT {
        sum / mass
    } else {
        0.0
    }
}

/// R = V·Uᵀ from H = U·Σ·Vᵀ with the reflection fix.
///
/// `Matrix::svd` returns singular values in descending order, so the last
/// column of V belongs to the weakest direction.
fn rotation_from_covariance(h: &Matrix3<f64>) -> Result<Matrix3<f64>, DegenerateGeometry> {
    let svd = h.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(DegenerateGeometry::DecompositionFailed);
    };

    let s = svd.singular_values;
    if !(s[0] > MIN_SINGULAR_VALUE) || s[1] <= RANK_RATIO_TOLERANCE * s[0] {
        return Err(DegenerateGeometry::RankDeficient {
            singular_values: [s[0], s[1], s[2]],
        });
    }

    let mut v = v_t.transpose();
    let mut rotation = v * u.transpose();
    if rotation.determinant() < 0.0 {
        v.column_mut(2).neg_mut();
        rotation = v * u.transpose();
    }

    Ok(rotation)
}
