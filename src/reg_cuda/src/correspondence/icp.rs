//! Nearest-neighbour ICP.
//!
//! Each transformed source point is matched to its closest target point
//! through an immutable k-d tree built once per run. All matches have weight
//! 1; there is no outlier handling.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::Vector3;
use rayon::prelude::*;

use super::{RegistrationStrategy, StepOutcome};
use crate::config::IcpConfig;
use crate::error::{RegistrationError, Result};
use crate::pose::{solve_absolute_orientation, WeightedPair};
use crate::types::RigidTransform;

/// Bucket size for the k-d tree.
///
/// Larger than kiddo's default so planar scans, where many points share a
/// coordinate on one axis, still split cleanly.
const BUCKET_SIZE: usize = 256;

/// k-d tree over the target set.
#[derive(Debug)]
pub struct NearestNeighborIndex {
    /// Generic args: coordinate f64, item u64 (index into the target set), K=3, bucket size
    kdtree: ImmutableKdTree<f64, u64, 3, BUCKET_SIZE>,
}

impl NearestNeighborIndex {
    /// Build the index. Returns `None` for an empty set.
    pub fn build(points: &[Vector3<f64>]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let coords: Vec<[f64; 3]> = points.iter().map(|p| [p.x, p.y, p.z]).collect();
        // item value is the slice index
        let kdtree: ImmutableKdTree<f64, u64, 3, BUCKET_SIZE> = (&*coords).into();
        Some(Self { kdtree })
    }

    /// Index of the closest point and its squared distance.
    ///
    /// Ties are resolved by the tree's fixed traversal order, so repeated
    /// queries give the same answer.
    pub fn nearest(&self, query: &Vector3<f64>) -> (usize, f64) {
        let nn = self
            .kdtree
            .nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
        (nn.item as usize, nn.distance)
    }

    pub fn len(&self) -> usize {
        self.kdtree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.kdtree.size() == 0
    }
}

/// ICP correspondence strategy.
pub struct IcpStrategy {
    target: Vec<Vector3<f64>>,
    source: Vec<Vector3<f64>>,
    index: NearestNeighborIndex,
    max_iteration: usize,
}

impl IcpStrategy {
    pub fn new(
        target: Vec<Vector3<f64>>,
        source: Vec<Vector3<f64>>,
        config: &IcpConfig,
    ) -> Result<Self> {
        let index = NearestNeighborIndex::build(&target)
            .ok_or_else(|| RegistrationError::input("target point set is empty"))?;
        Ok(Self {
            target,
            source,
            index,
            max_iteration: config.max_iteration,
        })
    }

    /// Nearest target index and squared distance for every source point under `transform`.
    pub fn correspondences(&self, transform: &RigidTransform) -> Vec<(usize, f64)> {
        self.source
            .par_iter()
            .map(|y| self.index.nearest(&transform.apply(y)))
            .collect()
    }
}

impl RegistrationStrategy for IcpStrategy {
    fn name(&self) -> &'static str {
        "icp"
    }

    fn iteration_bound(&self) -> usize {
        self.max_iteration
    }

    fn supports_early_stop(&self) -> bool {
        true
    }

    fn iterate(&mut self, current: &RigidTransform) -> Result<StepOutcome> {
        let matches = self.correspondences(current);

        let residual =
            matches.iter().map(|(_, d2)| d2).sum::<f64>() / matches.len().max(1) as f64;

        let pairs: Vec<WeightedPair> = self
            .source
            .iter()
            .zip(&matches)
            .map(|(y, &(j, _))| WeightedPair::new(self.target[j], *y, 1.0))
            .collect();

        Ok(StepOutcome {
            candidate: solve_absolute_orientation(&pairs),
            residual,
            control: None,
            marginal_error: None,
        })
    }
}
