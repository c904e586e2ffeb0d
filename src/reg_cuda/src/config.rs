//! Registration parameters.
//!
//! A flat, algorithm-scoped set of numeric knobs. Every field has a default
//! matching the reference driver, so partial JSON files and partial CLI
//! overrides are both valid.

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};

/// Registration algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Nearest-neighbour ICP.
    Icp,

    /// EM-ICP on the data-parallel backend (CUDA when available, else Rayon).
    EmIcp,

    /// EM-ICP on the serial reference backend.
    EmIcpCpu,

    /// Deterministic-annealing Softassign.
    #[default]
    Softassign,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Icp => "icp",
            Algorithm::EmIcp => "emicp",
            Algorithm::EmIcpCpu => "emicp-cpu",
            Algorithm::Softassign => "softassign",
        }
    }
}

/// EM-ICP expectation-step backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmIcpBackendKind {
    /// Single-threaded reference implementation.
    Serial,

    /// Rayon data-parallel map over source points.
    Parallel,

    /// CubeCL CUDA kernel; falls back to `Parallel` without the `cuda`
    /// feature or a usable device.
    #[default]
    Cuda,
}

/// ICP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Outer iteration bound (`maxIteration`).
    pub max_iteration: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self { max_iteration: 30 }
    }
}

/// EM-ICP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmIcpConfig {
    /// Initial variance σ² (`sigma_p2`).
    pub sigma_p2: f64,

    /// Variance floor; annealing stops once σ² drops to it (`sigma_inf`).
    pub sigma_inf: f64,

    /// Per-step variance decay (`sigma_factor`).
    pub sigma_factor: f64,

    /// Outlier distance scale, in squared distance units (`d_02`).
    ///
    /// A source point whose squared distance to every target exceeds roughly
    /// this value puts most of its mass into the outlier component.
    pub d_02: f64,

    /// Outlier component strength (`moutlier` for EM-ICP). Zero disables the
    /// outlier component.
    pub outlier_weight: f64,

    /// Backend used when the algorithm is `EmIcp`. `EmIcpCpu` always uses `Serial`.
    pub backend: EmIcpBackendKind,
}

impl Default for EmIcpConfig {
    fn default() -> Self {
        Self {
            sigma_p2: 0.01,
            sigma_inf: 1e-5,
            sigma_factor: 0.9,
            d_02: 0.01,
            outlier_weight: 1.0,
            backend: EmIcpBackendKind::default(),
        }
    }
}

/// Softassign parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftassignConfig {
    /// Outer iteration bound (`JMAX`).
    pub jmax: usize,

    /// Sinkhorn normalization passes per assignment pass (`I0`).
    pub i0: usize,

    /// Assignment-recompute passes per temperature (`I1`).
    pub i1: usize,

    /// Outlier competition strength, in squared distance units (`alpha`).
    pub alpha: f64,

    /// Initial temperature (`T_0`).
    pub t_0: f64,

    /// Per-step temperature decay (`TFACTOR`).
    pub t_factor: f64,

    /// Slack entry value (`moutlier`). Defaults to `e⁻¹/√T_0` when unset.
    pub moutlier: Option<f64>,

    /// Optional temperature floor ending the schedule early.
    pub t_min: Option<f64>,

    /// Sinkhorn stops early once every real row and column sums to 1 within this.
    pub sinkhorn_epsilon: f64,
}

impl Default for SoftassignConfig {
    fn default() -> Self {
        Self {
            jmax: 100,
            i0: 5,
            i1: 3,
            alpha: 3.0,
            t_0: 100.0,
            t_factor: 0.95,
            moutlier: None,
            t_min: None,
            sinkhorn_epsilon: 1e-3,
        }
    }
}

impl SoftassignConfig {
    /// Slack value actually used: the configured `moutlier`, or `e⁻¹/√T_0`.
    pub fn effective_moutlier(&self) -> f64 {
        self.moutlier
            .unwrap_or_else(|| (-1.0f64).exp() / self.t_0.sqrt())
    }
}

/// Termination thresholds shared by all algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Converged once rotation angle + translation change per iteration is below this.
    pub transformation_epsilon: f64,

    /// Converged (ICP) once the residual changes by less than this.
    pub residual_epsilon: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            transformation_epsilon: 1e-8,
            residual_epsilon: 1e-12,
        }
    }
}

/// All parameters of a registration run. Read-only once a run starts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParameters {
    pub algorithm: Algorithm,
    pub icp: IcpConfig,
    pub em_icp: EmIcpConfig,
    pub softassign: SoftassignConfig,
    pub convergence: ConvergenceConfig,
}

impl RegistrationParameters {
    /// Default parameters for the given algorithm.
    pub fn for_algorithm(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RegistrationError::config(format!("cannot parse parameters: {e}")))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RegistrationError::config(format!("cannot serialize parameters: {e}")))
    }

    /// Check the parameters of the selected algorithm.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::Icp => {
                if self.icp.max_iteration == 0 {
                    return Err(RegistrationError::config("maxIteration must be positive"));
                }
            }
            Algorithm::EmIcp | Algorithm::EmIcpCpu => {
                let c = &self.em_icp;
                positive("sigma_p2", c.sigma_p2)?;
                positive("sigma_inf", c.sigma_inf)?;
                positive("d_02", c.d_02)?;
                unit_interval("sigma_factor", c.sigma_factor)?;
                if !(c.outlier_weight >= 0.0) || !c.outlier_weight.is_finite() {
                    return Err(RegistrationError::config(format!(
                        "outlier weight must be finite and nonnegative, got {}",
                        c.outlier_weight
                    )));
                }
            }
            Algorithm::Softassign => {
                let c = &self.softassign;
                if c.jmax == 0 || c.i0 == 0 || c.i1 == 0 {
                    return Err(RegistrationError::config(format!(
                        "JMAX, I0 and I1 must be positive (got {}, {}, {})",
                        c.jmax, c.i0, c.i1
                    )));
                }
                positive("T_0", c.t_0)?;
                unit_interval("TFACTOR", c.t_factor)?;
                positive("moutlier", c.effective_moutlier())?;
                positive("sinkhorn_epsilon", c.sinkhorn_epsilon)?;
                if !c.alpha.is_finite() {
                    return Err(RegistrationError::config("alpha must be finite"));
                }
                if let Some(t_min) = c.t_min {
                    positive("t_min", t_min)?;
                }
            }
        }

        let conv = &self.convergence;
        if !(conv.transformation_epsilon >= 0.0) || !(conv.residual_epsilon >= 0.0) {
            return Err(RegistrationError::config(
                "convergence thresholds must be nonnegative",
            ));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(RegistrationError::config(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(RegistrationError::config(format!(
            "{name} must lie in (0, 1), got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_match_driver() {
        let p = RegistrationParameters::default();
        assert_eq!(p.algorithm, Algorithm::Softassign);
        assert_eq!(p.icp.max_iteration, 30);
        assert_eq!(p.em_icp.sigma_p2, 0.01);
        assert_eq!(p.em_icp.sigma_inf, 1e-5);
        assert_eq!(p.em_icp.sigma_factor, 0.9);
        assert_eq!(p.em_icp.d_02, 0.01);
        assert_eq!(p.softassign.jmax, 100);
        assert_eq!(p.softassign.i0, 5);
        assert_eq!(p.softassign.i1, 3);
        assert_eq!(p.softassign.alpha, 3.0);
        assert_eq!(p.softassign.t_0, 100.0);
        assert_eq!(p.softassign.t_factor, 0.95);
    }

    #[test]
    fn test_moutlier_derived_from_t0() {
        let c = SoftassignConfig::default();
        assert_relative_eq!(c.effective_moutlier(), (-1.0f64).exp() / 10.0, epsilon = 1e-15);

        let c = SoftassignConfig {
            moutlier: Some(0.5),
            ..Default::default()
        };
        assert_eq!(c.effective_moutlier(), 0.5);
    }

    #[test]
    fn test_defaults_validate() {
        for algorithm in [
            Algorithm::Icp,
            Algorithm::EmIcp,
            Algorithm::EmIcpCpu,
            Algorithm::Softassign,
        ] {
            RegistrationParameters::for_algorithm(algorithm)
                .validate()
                .unwrap();
        }
    }

    #[test]
    fn test_invalid_factor_rejected() {
        let mut p = RegistrationParameters::for_algorithm(Algorithm::EmIcp);
        p.em_icp.sigma_factor = 1.0;
        assert!(matches!(
            p.validate(),
            Err(RegistrationError::Configuration(_))
        ));

        let mut p = RegistrationParameters::for_algorithm(Algorithm::Softassign);
        p.softassign.i0 = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_other_algorithm_fields_ignored() {
        // Softassign knobs do not matter for an ICP run.
        let mut p = RegistrationParameters::for_algorithm(Algorithm::Icp);
        p.softassign.t_factor = 5.0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let p = RegistrationParameters::from_json(
            r#"{ "algorithm": "emicp-cpu", "em_icp": { "sigma_p2": 0.05 } }"#,
        )
        .unwrap();
        assert_eq!(p.algorithm, Algorithm::EmIcpCpu);
        assert_eq!(p.em_icp.sigma_p2, 0.05);
        assert_eq!(p.em_icp.sigma_factor, 0.9);
        assert_eq!(p.icp.max_iteration, 30);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut p = RegistrationParameters::for_algorithm(Algorithm::Icp);
        p.icp.max_iteration = 7;
        let back = RegistrationParameters::from_json(&p.to_json_pretty().unwrap()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn test_bad_json_is_configuration_error() {
        assert!(matches!(
            RegistrationParameters::from_json("{ not json"),
            Err(RegistrationError::Configuration(_))
        ));
    }
}
