//! Error types for the multiverse systematics engine.

use thiserror::Error;

/// Engine error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input: absent or duplicate name, dimension mismatch, invalid binning.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numeric failure while computing.
    #[error("Computation error: {0}")]
    Computation(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
