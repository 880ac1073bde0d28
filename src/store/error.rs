//! Error types for store operations

use std::fmt;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when talking to the backing store
#[derive(Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    Backend(String),

    /// The requested record does not exist
    NotFound(String),

    /// I/O error (connection, file access, etc.)
    IoError(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
            StoreError::NotFound(msg) => write!(f, "record not found: {}", msg),
            StoreError::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err)
    }
}
