//! Pre-registration point cloud preparation: random subsampling and scale
//! normalization.

use anyhow::{ensure, Result};
use nalgebra::{Matrix3, Vector3};
use rand::Rng;

/// Covariance trace both clouds are scaled to by [`align_scale_once`].
pub const NORMALIZED_COVARIANCE_TRACE: f64 = 0.003;

/// Keep each point independently with probability `percent / 100`.
pub fn subsample<R: Rng>(points: &[[f32; 3]], percent: f64, rng: &mut R) -> Result<Vec<[f32; 3]>> {
    ensure!(
        percent > 0.0 && percent <= 100.0,
        "reduction rate must be in (0, 100], got {percent}"
    );
    let keep = percent / 100.0;
    Ok(points
        .iter()
        .filter(|_| rng.gen::<f64>() < keep)
        .copied()
        .collect())
}

/// Mean and covariance (normalized by N) of a point cloud.
pub fn mean_and_covariance(points: &[[f32; 3]]) -> (Vector3<f64>, Matrix3<f64>) {
    if points.is_empty() {
        return (Vector3::zeros(), Matrix3::zeros());
    }
    let n = points.len() as f64;
    let mean = points.iter().map(vector).sum::<Vector3<f64>>() / n;
    let covariance = points
        .iter()
        .map(|p| {
            let d = vector(p) - mean;
            d * d.transpose()
        })
        .sum::<Matrix3<f64>>()
        / n;
    (mean, covariance)
}

fn vector(p: &[f32; 3]) -> Vector3<f64> {
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

/// Multiply every coordinate by `s` (scaling about the origin).
pub fn scale_points(points: &mut [[f32; 3]], s: f64) {
    for p in points.iter_mut() {
        for c in p.iter_mut() {
            *c = (*c as f64 * s) as f32;
        }
    }
}

fn spread(points: &[[f32; 3]]) -> Result<f64> {
    let trace = mean_and_covariance(points).1.trace();
    ensure!(trace > 0.0, "point cloud has zero spread");
    Ok(trace)
}

/// Scale each cloud independently so its covariance trace becomes
/// [`NORMALIZED_COVARIANCE_TRACE`]. Returns the two scale factors applied.
pub fn align_scale_once(target: &mut [[f32; 3]], source: &mut [[f32; 3]]) -> Result<(f64, f64)> {
    let s_target = (NORMALIZED_COVARIANCE_TRACE / spread(target)?).sqrt();
    let s_source = (NORMALIZED_COVARIANCE_TRACE / spread(source)?).sqrt();
    scale_points(target, s_target);
    scale_points(source, s_source);
    Ok((s_target, s_source))
}

/// Symmetric scale estimate (Horn): scale the source so its covariance
/// trace matches the target's. Returns the factor applied.
pub fn align_scale_to_target(target: &[[f32; 3]], source: &mut [[f32; 3]]) -> Result<f64> {
    let s = (spread(target)? / spread(source)?).sqrt();
    scale_points(source, s);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn grid() -> Vec<[f32; 3]> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                for k in 0..3 {
                    points.push([i as f32, j as f32 * 0.5, k as f32 * 0.25 + 1.0]);
                }
            }
        }
        points
    }

    #[test]
    fn test_subsample_is_seeded() {
        let points = grid();
        let a = subsample(&points, 50.0, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = subsample(&points, 50.0, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
        assert!(a.len() < points.len());
        assert!(a.iter().all(|p| points.contains(p)));
    }

    #[test]
    fn test_subsample_full_rate_keeps_all() {
        let points = grid();
        let kept = subsample(&points, 100.0, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(kept, points);
        assert!(subsample(&points, 0.0, &mut StdRng::seed_from_u64(1)).is_err());
        assert!(subsample(&points, 150.0, &mut StdRng::seed_from_u64(1)).is_err());
    }

    #[test]
    fn test_align_scale_once_normalizes_trace() {
        let mut target = grid();
        let mut source: Vec<[f32; 3]> = grid().iter().map(|p| [p[0] * 3.0, p[1] * 3.0, p[2] * 3.0]).collect();
        align_scale_once(&mut target, &mut source).unwrap();
        assert_relative_eq!(mean_and_covariance(&target).1.trace(), 0.003, max_relative = 1e-4);
        assert_relative_eq!(mean_and_covariance(&source).1.trace(), 0.003, max_relative = 1e-4);
    }

    #[test]
    fn test_align_scale_to_target() {
        let target = grid();
        let mut source: Vec<[f32; 3]> = target.iter().map(|p| [p[0] * 0.5, p[1] * 0.5, p[2] * 0.5]).collect();
        let s = align_scale_to_target(&target, &mut source).unwrap();
        assert_relative_eq!(s, 2.0, max_relative = 1e-5);
        assert_relative_eq!(source[7][0], target[7][0], epsilon = 1e-5);
    }

    #[test]
    fn test_degenerate_cloud_rejected() {
        let mut a = vec![[1.0f32, 1.0, 1.0]; 4];
        let mut b = grid();
        assert!(align_scale_once(&mut a, &mut b).is_err());
    }
}
