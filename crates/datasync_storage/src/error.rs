//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store open.
    #[error("storage at {0:?} is locked by another process")]
    Locked(PathBuf),

    /// A batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl StorageError {
    /// Returns true if the stored data can no longer be trusted.
    ///
    /// Everything else (I/O failures, lock contention) may succeed on retry.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_classification() {
        assert!(StorageError::Corrupted("bad digest".into()).is_corruption());
        assert!(!StorageError::Locked(PathBuf::from("/tmp/x")).is_corruption());
        assert!(!StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_corruption());
    }
}
