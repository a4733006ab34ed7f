//! Error types for the Slomo service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Slomo operations.
#[derive(Error, Debug)]
pub enum SlomoError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request log store could not be read or written
    #[error("Request log store error: {0}")]
    Store(#[from] StoreError),

    /// The stored request log is present but cannot be decoded
    #[error("Malformed request log: {0}")]
    CorruptLog(#[from] serde_json::Error),

    /// Every compare-and-swap attempt lost to a concurrent writer
    #[error("Request log update abandoned after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slomo operations.
pub type Result<T> = std::result::Result<T, SlomoError>;
