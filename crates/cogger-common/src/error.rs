//! Error types shared across the cogger workspace

use thiserror::Error;

/// Result type alias for cogger operations
pub type Result<T> = std::result::Result<T, CoggerError>;

/// Main error type for cogger
#[derive(Error, Debug)]
pub enum CoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
