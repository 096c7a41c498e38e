//! Error types for the spatial transformer.
//!
//! Every failure is reported to the immediate caller; nothing is retried and
//! nothing is downgraded to a log message inside the crate.

use thiserror::Error;

/// Errors produced by configuration, shape validation, operator sequencing and
/// the compute backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StnError {
    /// Invalid construction-time parameters (empty or non-positive spacing,
    /// unreadable configuration).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Rank or extent mismatch between image, map, spacing or gradient.
    #[error("Shape mismatch: {0}")]
    Shape(String),

    /// Operator called out of sequence (backward without a pending forward).
    #[error("Invalid operator state: {0}")]
    State(String),

    /// The requested compute unit is unavailable or failed.
    #[error("Compute backend error: {0}")]
    Compute(String),
}

/// Result type for spatial transformer operations.
pub type Result<T> = std::result::Result<T, StnError>;

impl StnError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape error.
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a compute error.
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute(msg.into())
    }
}
