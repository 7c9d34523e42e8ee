//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter configuration, reported at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid per-request argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The storage lock could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// The storage lock could not be released
    #[error("Unlock error: {0}")]
    Unlock(String),

    /// Persisted state could not be written or read
    #[error("Persist error: {0}")]
    Persist(String),

    /// Persisted state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
