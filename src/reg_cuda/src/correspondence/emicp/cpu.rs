//! Host E-step backends.

use nalgebra::Vector3;
use rayon::prelude::*;

use super::{soft_match_row, EStepBackend, OutlierModel};
use crate::error::Result;
use crate::pose::SoftMatch;

/// Single-threaded reference backend.
#[derive(Debug, Clone)]
pub struct SerialBackend {
    target: Vec<Vector3<f64>>,
}

impl SerialBackend {
    pub fn new(target: Vec<Vector3<f64>>) -> Self {
        Self { target }
    }
}

impl EStepBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn expectation(
        &mut self,
        moved_source: &[Vector3<f64>],
        sigma2: f64,
        outlier: &OutlierModel,
    ) -> Result<Vec<SoftMatch>> {
        Ok(moved_source
            .iter()
            .map(|y| soft_match_row(&self.target, y, sigma2, outlier))
            .collect())
    }
}

/// Rayon backend: rows are independent, so each worker writes its own rows.
#[derive(Debug, Clone)]
pub struct ParallelBackend {
    target: Vec<Vector3<f64>>,
}

impl ParallelBackend {
    pub fn new(target: Vec<Vector3<f64>>) -> Self {
        Self { target }
    }
}

impl EStepBackend for ParallelBackend {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn expectation(
        &mut self,
        moved_source: &[Vector3<f64>],
        sigma2: f64,
        outlier: &OutlierModel,
    ) -> Result<Vec<SoftMatch>> {
        Ok(moved_source
            .par_iter()
            .map(|y| soft_match_row(&self.target, y, sigma2, outlier))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_random_cloud, small_perturbation, transform_cloud};
    use crate::types::to_vectors;

    #[test]
    fn test_serial_and_parallel_rows_identical() {
        let target_pts = make_random_cloud(300, 31);
        let source_pts = transform_cloud(&target_pts, &small_perturbation());
        let target = to_vectors(&target_pts);
        let source = to_vectors(&source_pts);
        let outlier = OutlierModel::new(0.01, 1.0);

        let mut serial = SerialBackend::new(target.clone());
        let mut parallel = ParallelBackend::new(target);
        for sigma2 in [0.01, 1e-3, 1e-5] {
            let a = serial.expectation(&source, sigma2, &outlier).unwrap();
            let b = parallel.expectation(&source, sigma2, &outlier).unwrap();
            assert_eq!(a, b);
        }
    }
}
