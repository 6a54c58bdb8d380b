//! Error types for the protocol layer.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or transporting frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame announced a length above the configured limit.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame carried a different message type than expected.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected type name.
        expected: &'static str,
        /// Received type name.
        actual: String,
    },

    /// An object key could not be decoded.
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Transport I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
