//! Debug types for registration iteration tracking.
//!
//! Captures the state after each outer iteration so a run can be dumped to
//! JSON and inspected offline.

use serde::Serialize;

use crate::types::RigidTransform;

/// State captured after one outer iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationRecord {
    /// Outer iteration number (0-indexed).
    pub iteration: usize,

    /// Control parameter in effect during this iteration (σ² or T). `None` for ICP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<f64>,

    /// Rotation after this iteration, row-major.
    pub rotation: Vec<f64>,

    /// Translation after this iteration.
    pub translation: Vec<f64>,

    /// Residual reported by the strategy (mean squared correspondence distance).
    pub residual: f64,

    /// Largest row or column deviation from 1 of the balanced Softassign matrix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marginal_error: Option<f64>,

    /// Rotation angle plus translation distance relative to the previous iteration.
    pub change: f64,

    /// Whether the pose solve was rejected as degenerate.
    pub degenerate: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub degenerate_reason: Option<String>,

    /// Wall time of this iteration in milliseconds.
    pub elapsed_ms: f64,
}

impl IterationRecord {
    pub fn new(iteration: usize, transform: &RigidTransform) -> Self {
        Self {
            iteration,
            rotation: transform.rotation_row_major().to_vec(),
            translation: transform.translation.iter().copied().collect(),
            ..Default::default()
        }
    }
}

/// Complete history for one registration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationTrace {
    /// Algorithm name (`icp`, `emicp`, `emicp-cpu`, `softassign`).
    pub algorithm: String,

    /// Expectation backend actually used (EM-ICP only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    pub num_target_points: usize,
    pub num_source_points: usize,

    /// Initial rotation, row-major.
    pub initial_rotation: Vec<f64>,
    pub initial_translation: Vec<f64>,

    /// Final rotation, row-major.
    pub final_rotation: Vec<f64>,
    pub final_translation: Vec<f64>,

    /// Iteration history.
    pub iterations: Vec<IterationRecord>,

    /// Final status (`Converged`, `IterationLimitReached`, `Cancelled`).
    pub status: String,

    pub total_iterations: usize,
    pub degenerate_iterations: usize,
    pub final_residual: f64,

    /// Total wall time in milliseconds.
    pub total_ms: f64,
}

impl RegistrationTrace {
    pub fn new(algorithm: &str, num_target_points: usize, num_source_points: usize) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            num_target_points,
            num_source_points,
            ..Default::default()
        }
    }

    pub fn set_initial_transform(&mut self, transform: &RigidTransform) {
        self.initial_rotation = transform.rotation_row_major().to_vec();
        self.initial_translation = transform.translation.iter().copied().collect();
    }

    pub fn set_final_transform(&mut self, transform: &RigidTransform) {
        self.final_rotation = transform.rotation_row_major().to_vec();
        self.final_translation = transform.translation.iter().copied().collect();
    }

    /// Append an iteration record.
    pub fn push(&mut self, record: IterationRecord) {
        self.iterations.push(record);
    }

    /// Residuals of every recorded iteration, in order.
    pub fn residuals(&self) -> Vec<f64> {
        self.iterations.iter().map(|r| r.residual).collect()
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
