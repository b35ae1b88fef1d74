//! Core error types

use thiserror::Error;

/// Core error type for the DPGO mesh
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration parsed but holds inconsistent values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Matrix data does not match its declared shape
    #[error("Matrix shape mismatch: expected {expected} elements for {rows}x{cols}, got {got}")]
    MatrixShape {
        /// Declared rows
        rows: usize,
        /// Declared columns
        cols: usize,
        /// rows * cols
        expected: usize,
        /// Elements actually supplied
        got: usize,
    },
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
