//! Deterministic-annealing schedule.
//!
//! Tracks a control parameter (σ² for EM-ICP, temperature T for Softassign)
//! that starts at `initial` and is multiplied by `factor` after each outer
//! iteration. A schedule is exhausted once the parameter drops to or below
//! its floor, or once the configured outer-iteration bound is used up.

use serde::{Deserialize, Serialize};

/// Geometric decay schedule with optional floor and iteration bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingSchedule {
    initial: f64,
    factor: f64,
    floor: Option<f64>,
    max_steps: Option<usize>,
    current: f64,
    outer_iteration: usize,
}

impl AnnealingSchedule {
    /// Schedule bounded by a fixed number of outer iterations.
    pub fn new(initial: f64, factor: f64, max_steps: usize) -> Self {
        Self {
            initial,
            factor,
            floor: None,
            max_steps: Some(max_steps),
            current: initial,
            outer_iteration: 0,
        }
    }

    /// Schedule that runs while the parameter stays above `floor`.
    pub fn with_floor(initial: f64, factor: f64, floor: f64) -> Self {
        Self {
            initial,
            factor,
            floor: Some(floor),
            max_steps: None,
            current: initial,
            outer_iteration: 0,
        }
    }

    /// Add (or tighten) a floor on an iteration-bounded schedule.
    pub fn floor(mut self, floor: Option<f64>) -> Self {
        self.floor = floor;
        self
    }

    /// Current control value (σ² or T).
    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn initial(&self) -> f64 {
        self.initial
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Number of completed outer iterations.
    pub fn outer_iteration(&self) -> usize {
        self.outer_iteration
    }

    /// Decay the control value after an outer iteration.
    pub fn advance(&mut self) {
        self.current *= self.factor;
        self.outer_iteration += 1;
    }

    /// Whether no further outer iterations should run.
    pub fn is_exhausted(&self) -> bool {
        let below_floor = self.floor.is_some_and(|floor| self.current <= floor);
        let out_of_steps = self
            .max_steps
            .is_some_and(|max| self.outer_iteration >= max);
        below_floor || out_of_steps
    }

    /// Total number of outer iterations this schedule runs from its start.
    ///
    /// Computed by replaying the same multiplications as `advance`, so the
    /// count agrees with the live schedule bit for bit.
    pub fn planned_steps(&self) -> usize {
        let mut replay = Self {
            current: self.initial,
            outer_iteration: 0,
            ..self.clone()
        };
        // factor >= 1 without a step bound never reaches the floor
        const HARD_CAP: usize = 1_000_000;
        while !replay.is_exhausted() && replay.outer_iteration < HARD_CAP {
            replay.advance();
        }
        replay.outer_iteration
    }
}
