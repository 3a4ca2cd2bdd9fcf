//! Error types for the scan batch engine.
//!
//! This module provides structured error handling with:
//! - `AppError`: Domain-specific errors for coordinator operations
//! - `Result<T>`: Type alias for Results using AppError

use thiserror::Error;

/// Domain-specific errors for batch coordination.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed call arguments. Caller bug; not retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Scan ID does not resolve in the scan store
    #[error("Scan not found: {0}")]
    ScanNotFound(String),

    /// A scan references a batch that does not exist.
    /// Referential integrity violation, surfaced loudly.
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// Underlying store I/O failure. Retryable by the job queue.
    #[error("Operation failed: {0}")]
    OperationFailed(#[from] anyhow::Error),
}

impl AppError {
    /// Create an invalid-input error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;
