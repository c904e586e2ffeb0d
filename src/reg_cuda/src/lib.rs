//! Rigid 3-D point-set registration with CubeCL CUDA and Rayon backends.
//!
//! This library estimates the rigid transform (R, t) minimizing
//! `Σ ‖x − (R·y + t)‖²` between a fixed target set X and a moving source set Y.
//!
//! # Architecture
//!
//! Each outer iteration is split into phases:
//! - Phase 1: Correspondence estimation (nearest neighbour, EM posterior, or Softassign)
//! - Phase 2: Pose solving (weighted absolute orientation via SVD)
//! - Phase 3: Annealing (σ² or temperature decay)
//! - Phase 4: Convergence / termination check
//!
//! Three strategies are available:
//! - **ICP**: k-d tree nearest neighbour, unit weights
//! - **EM-ICP**: Gaussian-mixture posteriors with an outlier component, annealed σ²;
//!   serial, Rayon data-parallel and CUDA (feature `cuda`) expectation backends
//! - **Softassign**: Sinkhorn-normalized assignment matrix with outlier slack,
//!   annealed temperature
//!
//! # Usage
//!
//! ```ignore
//! use reg_cuda::{Algorithm, RegistrationBuilder};
//!
//! let target: Vec<[f32; 3]> = load_points("x.ply");
//! let source: Vec<[f32; 3]> = load_points("y.ply");
//!
//! let result = RegistrationBuilder::new()
//!     .algorithm(Algorithm::EmIcp)
//!     .sigma_p2(0.01)
//!     .build()?
//!     .register(&target, &source)?;
//!
//! println!("Status: {:?}\n{}", result.status, result.transform);
//! ```

pub mod annealing;
pub mod config;
pub mod correspondence;
pub mod debug;
pub mod engine;
pub mod error;
pub mod pose;
pub mod registration;
pub mod test_utils;
pub mod transform_io;
pub mod types;

pub use annealing::AnnealingSchedule;
pub use config::{
    Algorithm, ConvergenceConfig, EmIcpBackendKind, EmIcpConfig, IcpConfig,
    RegistrationParameters, SoftassignConfig,
};
pub use correspondence::emicp::{
    posterior_row, select_backend, soft_match_row, EStepBackend, EmIcpStrategy, OutlierModel,
    ParallelBackend, SerialBackend,
};
pub use correspondence::icp::{IcpStrategy, NearestNeighborIndex};
pub use correspondence::softassign::{AssignmentMatrix, SinkhornStats, SoftassignStrategy};
pub use correspondence::{build_strategy, RegistrationStrategy, StepOutcome};
pub use debug::{IterationRecord, RegistrationTrace};
pub use engine::{
    register, EnginePhase, IterationObserver, IterationSnapshot, ObserverAction,
    RegistrationEngine,
};
pub use error::{RegistrationError, Result};
pub use pose::{
    solve_absolute_orientation, solve_soft_matches, DegenerateGeometry, SoftMatch, WeightedPair,
};
pub use registration::{Registration, RegistrationBuilder};
pub use transform_io::{format_transform, parse_transform, read_transform, write_transform};
pub use types::{to_vectors, RegistrationResult, RegistrationStatus, RigidTransform};

// CUDA runtime (optional, requires the `cuda` feature)
#[cfg(feature = "cuda")]
pub use correspondence::emicp::gpu::{is_cuda_available, CudaBackend};
