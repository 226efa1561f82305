use thiserror::Error;

use crate::backend::ExecutionTarget;

/// Unified error type for `phaseret` operations.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Raised when two volumes that must share a shape do not.
    #[error("shape mismatch in {context}: expected {expected:?} but found {found:?}")]
    ShapeMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The shape required by the session, usually the modulus shape.
        expected: [usize; 3],
        /// The shape that was actually supplied.
        found: [usize; 3],
    },

    /// Raised when a volume has a zero-length axis.
    #[error("{context} must contain at least one voxel, found shape {shape:?}")]
    EmptyVolume {
        context: &'static str,
        shape: [usize; 3],
    },

    /// Raised when the measured modulus (or intensity) holds a negative value.
    #[error("measured modulus must be non-negative, found {value} at {index:?}")]
    NegativeModulus { index: [usize; 3], value: f64 },

    /// Raised when an input volume holds NaN or infinity.
    #[error("{context} contains a non-finite value at {index:?}")]
    NonFiniteInput {
        context: &'static str,
        index: [usize; 3],
    },

    /// Raised when the requested execution target cannot host a session.
    #[error("execution target `{target}` is unavailable: {reason}")]
    UnsupportedTarget {
        target: ExecutionTarget,
        reason: String,
    },

    /// Raised when an operation is not implemented by the selected backend.
    #[error("{operation} is not supported on the `{target}` backend")]
    UnsupportedOperation {
        operation: &'static str,
        target: ExecutionTarget,
    },

    /// Raised when a tuning parameter falls outside its admissible range.
    #[error("parameter `{name}` must be {expected}, found {value}")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },

    /// Raised when the compute device fails while a session is running.
    #[error("device error: {0}")]
    Device(String),
}

impl PhaseError {
    /// Helper to format a [`ShapeMismatch`](PhaseError::ShapeMismatch) error.
    pub fn shape_mismatch(context: &'static str, expected: [usize; 3], found: [usize; 3]) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for parameter range violations.
    pub fn invalid_parameter(name: &'static str, value: f64, expected: &'static str) -> Self {
        Self::InvalidParameter {
            name,
            value,
            expected,
        }
    }

    /// Helper for wrapping device-side failures.
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, PhaseError>;
