//! Error types for the sync engine.

use datasync_crypto::CryptoError;
use datasync_protocol::ProtocolError;
use datasync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed or out-of-order message from the server.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Key handling, signature or decryption failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted row holds a value the schema does not allow.
    #[error("corrupt local state: {0}")]
    CorruptState(String),

    /// The server rejected the device.
    #[error("registration rejected: {0}")]
    Registration(String),

    /// An application value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Handshake or request deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A background store operation was cancelled or panicked.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The engine has been finalized.
    #[error("sync engine is shut down")]
    ShutDown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried on the next connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Protocol(ProtocolError::Io(_)) => true,
            SyncError::Storage(e) => !e.is_corruption(),
            _ => false,
        }
    }

    /// Returns true if local state can no longer be trusted.
    ///
    /// These errors are routed to the fatal-error handler instead of the
    /// `Error` sync state.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Storage(e) => e.is_corruption(),
            SyncError::CorruptState(_) => true,
            _ => false,
        }
    }
}
