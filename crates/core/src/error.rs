//! Core error types

use thiserror::Error;

/// Core error type for DevAuth
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected during validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, Error>;
