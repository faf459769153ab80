//! Error types for tiling selection and GEMM execution

use thiserror::Error;

/// Result type for GEMM planning and launch operations
pub type GemmResult<T> = Result<T, GemmError>;

/// Planning and launch errors.
///
/// Everything here is raised before any execution context starts. Once a
/// launch is running the pipeline has no error channel.
#[derive(Debug, Error)]
pub enum GemmError {
    #[error("Capacity exceeded in {tier}: need {required} bytes, have {available}")]
    CapacityExceeded {
        tier: &'static str,
        required: usize,
        available: usize,
    },

    #[error("Infeasible configuration: {message}")]
    Infeasible { message: String },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("Invalid tiling parameters: {message}")]
    InvalidTiling { message: String },

    #[error("Invalid tiling blob: {message}")]
    InvalidBlob { message: String },

    #[error("Invalid buffer {handle}: {message}")]
    InvalidBuffer { handle: usize, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GemmError {
    pub fn capacity(tier: &'static str, required: usize, available: usize) -> Self {
        GemmError::CapacityExceeded {
            tier,
            required,
            available,
        }
    }

    pub fn infeasible(msg: impl Into<String>) -> Self {
        GemmError::Infeasible { message: msg.into() }
    }

    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        GemmError::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn tiling(msg: impl Into<String>) -> Self {
        GemmError::InvalidTiling { message: msg.into() }
    }

    pub fn blob(msg: impl Into<String>) -> Self {
        GemmError::InvalidBlob { message: msg.into() }
    }

    pub fn buffer(handle: usize, msg: impl Into<String>) -> Self {
        GemmError::InvalidBuffer {
            handle,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GemmError::Config { message: msg.into() }
    }
}
