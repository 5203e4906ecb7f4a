//! Structured error types with machine-readable codes
//!
//! The error taxonomy mirrors how failures propagate through the engine:
//! validation errors fail fast (programming/config bugs), storage errors are
//! converted to degraded results at the adapter boundary, and malformed model
//! output is treated as "no signal" rather than an exception.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Serializable error report for diagnostics and logs
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,
}

/// Engine error types with proper categorization
#[derive(Debug)]
pub enum MemoryError {
    // Validation errors - always fail fast and loud
    DimensionMismatch { expected: usize, actual: usize, context: String },
    InvalidMatrix(String),
    InvalidConfig { field: String, reason: String },
    InvalidUserId(String),

    // Storage errors - caught at the adapter boundary, never reach turn processing
    StorageError(String),
    SerializationError(String),

    // Malformed model output - treated as "no signal"
    MalformedCitation(String),
    MalformedAction(String),

    // Generic wrapper for external errors
    Internal(anyhow::Error),
}

impl MemoryError {
    /// Get error code for log correlation
    pub fn code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::InvalidMatrix(_) => "INVALID_MATRIX",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::InvalidUserId(_) => "INVALID_USER_ID",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::MalformedCitation(_) => "MALFORMED_CITATION",
            Self::MalformedAction(_) => "MALFORMED_ACTION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error indicates a programming/config bug that should
    /// fail fast rather than degrade
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::InvalidMatrix(_)
                | Self::InvalidConfig { .. }
                | Self::InvalidUserId(_)
        )
    }

    /// Get detailed error message
    pub fn message(&self) -> String {
        match self {
            Self::DimensionMismatch { expected, actual, context } => {
                format!("Dimension mismatch in {context}: expected {expected}, got {actual}")
            }
            Self::InvalidMatrix(msg) => format!("Invalid matrix: {msg}"),
            Self::InvalidConfig { field, reason } => {
                format!("Invalid config for field '{field}': {reason}")
            }
            Self::InvalidUserId(msg) => format!("Invalid user ID: {msg}"),
            Self::StorageError(msg) => format!("Storage error: {msg}"),
            Self::SerializationError(msg) => format!("Serialization error: {msg}"),
            Self::MalformedCitation(msg) => format!("Malformed citation output: {msg}"),
            Self::MalformedAction(msg) => format!("Malformed merge action: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    /// Convert to a serializable report
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for MemoryError {}

impl From<anyhow::Error> for MemoryError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Type alias for Results using MemoryError
pub type Result<T> = std::result::Result<T, MemoryError>;
