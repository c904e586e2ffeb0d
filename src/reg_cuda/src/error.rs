//! Error types for registration.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = RegistrationError> = std::result::Result<T, E>;

/// Errors surfaced by the registration engine.
///
/// Degenerate geometry inside a single iteration is not an error: the engine
/// keeps the previous transform and records the event in the trace.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Empty or too-small point sets, rejected before any iteration starts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Parameters outside their valid range.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A transform file that does not hold exactly 12 floating-point values.
    #[error("malformed transform: {0}")]
    TransformFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside a compute backend (device initialization, kernel launch).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl RegistrationError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
