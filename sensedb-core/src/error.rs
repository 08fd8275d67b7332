//! Error types for SenseDB

use thiserror::Error;

/// Result type alias for SenseDB operations
pub type Result<T> = std::result::Result<T, SenseError>;

/// SenseDB error types
#[derive(Error, Debug)]
pub enum SenseError {
    /// Invalid input from the caller, rejected before any side effect
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Free disk space is at or below the configured floor
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    /// A flush, delete or compaction failed
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The disk space probe returned nothing
    #[error("Space probe unavailable: {0}")]
    ProbeUnavailable(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SenseError {
    /// Check if the error was caused by caller input
    pub fn is_caller_error(&self) -> bool {
        matches!(self, SenseError::InvalidArgument(_))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SenseError::Io(_) | SenseError::Persistence(_) | SenseError::ProbeUnavailable(_)
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SenseError::Corruption(_) | SenseError::ChecksumMismatch { .. }
        )
    }

    /// Collapse any error into a persistence failure that can be handed to
    /// several waiters at once.
    pub fn to_persistence(&self) -> SenseError {
        match self {
            SenseError::Persistence(msg) => SenseError::Persistence(msg.clone()),
            other => SenseError::Persistence(other.to_string()),
        }
    }
}
