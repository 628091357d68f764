//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error (config file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config parse error.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
