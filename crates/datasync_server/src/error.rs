//! Error types for the relay server.

use datasync_crypto::CryptoError;
use datasync_protocol::ProtocolError;
use datasync_storage::StorageError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the relay server.
///
/// Every variant closes the offending connection; none is reported to
/// the peer.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed or oversized frame.
    #[error("data stream error: {0}")]
    DataStream(#[from] ProtocolError),

    /// The peer broke the protocol (wrong message for the session state,
    /// nonce mismatch, unknown account).
    #[error("client error: {0}")]
    Client(String),

    /// Signature did not verify or a key was unusable.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The database failed.
    #[error("database error: {0}")]
    Database(#[from] StorageError),

    /// The database schema is newer than this server.
    #[error("unsupported schema version {found}, expected {expected}")]
    Schema {
        /// Version found in the database.
        found: u32,
        /// Version this server writes.
        expected: u32,
    },

    /// A worker task failed.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if the peer caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::DataStream(_) | ServerError::Client(_) | ServerError::Crypto(_)
        )
    }

    /// Returns true if the error is likely to go away on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Database(e) => !e.is_corruption(),
            ServerError::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::Client("nonce mismatch".into()).is_client_error());
        assert!(ServerError::Crypto(CryptoError::BadSignature).is_client_error());
        assert!(!ServerError::Internal("join".into()).is_client_error());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk busy");
        assert!(ServerError::Database(StorageError::Io(io)).is_transient());
        assert!(!ServerError::Database(StorageError::Corrupted("digest".into())).is_transient());
    }

    #[test]
    fn error_display() {
        let err = ServerError::Schema {
            found: 3,
            expected: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('1'));
    }
}
