//! Transform persistence.
//!
//! Plain-text format: the 9 rotation entries in row-major order followed by
//! the 3 translation entries, whitespace separated. Written as three rows of
//! three rotation values and one row of translation, six decimals each.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::{RegistrationError, Result};
use crate::types::RigidTransform;

/// Number of values in a persisted transform.
pub const TRANSFORM_VALUE_COUNT: usize = 12;

/// Render a transform in the persisted text format.
pub fn format_transform(transform: &RigidTransform) -> String {
    let mut out = String::new();
    for (i, value) in transform.rotation_row_major().iter().enumerate() {
        out.push_str(&format!("{value:.6} "));
        if (i + 1) % 3 == 0 {
            out.push('\n');
        }
    }
    for value in transform.translation.iter() {
        out.push_str(&format!("{value:.6} "));
    }
    out.push('\n');
    out
}

/// Parse exactly 12 whitespace-separated floats into a transform.
///
/// The rotation is taken as stored; callers that need a proper rotation
/// project it with [`RigidTransform::project_to_rotation`].
pub fn parse_transform(text: &str) -> Result<RigidTransform> {
    let values = text
        .split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|_| {
                RegistrationError::TransformFormat(format!("not a number: {token:?}"))
            })
        })
        .collect::<Result<Vec<f64>>>()?;

    if values.len() != TRANSFORM_VALUE_COUNT {
        return Err(RegistrationError::TransformFormat(format!(
            "expected {TRANSFORM_VALUE_COUNT} values, found {}",
            values.len()
        )));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(RegistrationError::TransformFormat(format!(
            "non-finite value {bad}"
        )));
    }

    let mut rotation = [0.0; 9];
    rotation.copy_from_slice(&values[..9]);
    let translation = [values[9], values[10], values[11]];
    Ok(RigidTransform::from_row_major(&rotation, &translation))
}

/// Load a transform from a file.
pub fn read_transform(path: impl AsRef<Path>) -> Result<RigidTransform> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let transform = parse_transform(&text).map_err(|e| match e {
        RegistrationError::TransformFormat(msg) => {
            RegistrationError::TransformFormat(format!("{}: {msg}", path.display()))
        }
        other => other,
    })?;
    debug!(path = %path.display(), "Loaded transform");
    Ok(transform)
}

/// Save a transform to a file, overwriting it.
pub fn write_transform(path: impl AsRef<Path>, transform: &RigidTransform) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_transform(transform))?;
    debug!(path = %path.display(), "Saved transform");
    Ok(())
}
