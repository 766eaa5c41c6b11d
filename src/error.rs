//! Error types and handling.

use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::ScanError;
use crate::loader::LoaderError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Device discovery failed
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Image load failed or was rejected
    #[error("Load error: {0}")]
    Loader(#[from] LoaderError),

    /// Load cancelled by the user
    #[error("Load cancelled")]
    Cancelled,

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for AppError
pub type Result<T> = std::result::Result<T, AppError>;
