//! Test utilities.
//!
//! Synthetic point cloud generators and perturbations with known ground
//! truth, shared by the unit tests and the driver's tests.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::types::RigidTransform;

/// Half extents of the box sampled by [`make_random_cloud`].
///
/// Anisotropic so the principal axes are well separated and the rotation
/// is uniquely determined.
pub const RANDOM_CLOUD_EXTENTS: [f32; 3] = [0.5, 0.3, 0.2];

/// Uniform random points in the box `±RANDOM_CLOUD_EXTENTS`.
pub fn make_random_cloud(num_points: usize, seed: u64) -> Vec<[f32; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let [ex, ey, ez] = RANDOM_CLOUD_EXTENTS;
    (0..num_points)
        .map(|_| {
            [
                rng.gen_range(-ex..ex),
                rng.gen_range(-ey..ey),
                rng.gen_range(-ez..ez),
            ]
        })
        .collect()
}

/// Grid points on the three coordinate planes bounding the positive octant,
/// each face `extent` wide with grid `spacing`. Shared edges appear once.
pub fn make_corner_planes(extent: f32, spacing: f32) -> Vec<[f32; 3]> {
    let n = (extent / spacing).round() as usize + 1;
    let mut points = Vec::with_capacity(3 * n * n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                if i == 0 || j == 0 || k == 0 {
                    points.push([i as f32 * spacing, j as f32 * spacing, k as f32 * spacing]);
                }
            }
        }
    }
    points
}

/// Apply a rigid transform to single-precision points.
pub fn transform_cloud(points: &[[f32; 3]], transform: &RigidTransform) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|p| {
            let v = transform.apply(&Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64));
            [v.x as f32, v.y as f32, v.z as f32]
        })
        .collect()
}

/// Add isotropic Gaussian noise with standard deviation `sigma`.
pub fn add_gaussian_noise(points: &[[f32; 3]], sigma: f32, seed: u64) -> Vec<[f32; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let Ok(dist) = Normal::new(0.0f32, sigma) else {
        return points.to_vec();
    };
    points
        .iter()
        .map(|p| {
            [
                p[0] + dist.sample(&mut rng),
                p[1] + dist.sample(&mut rng),
                p[2] + dist.sample(&mut rng),
            ]
        })
        .collect()
}

/// Small rigid perturbation used by the recovery tests: about 3° around a
/// skewed axis plus a few centimetres of translation.
pub fn small_perturbation() -> RigidTransform {
    RigidTransform::from_axis_angle(
        &Vector3::new(0.2, -0.4, 1.0),
        3.0f64.to_radians(),
        Vector3::new(0.03, -0.02, 0.01),
    )
}
