//! Shared error type for the common crate

use thiserror::Error;

/// Errors produced by the common crate itself (config and unit handling).
#[derive(Debug, Error)]
pub enum CommonError {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the common crate
pub type Result<T> = std::result::Result<T, CommonError>;
