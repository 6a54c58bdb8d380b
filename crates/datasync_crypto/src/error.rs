//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by key handling, signing and encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The algorithm identifier is not supported.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The algorithm does not accept the given parameter.
    #[error("invalid parameter {param:?} for algorithm {algorithm}")]
    InvalidParam {
        /// Algorithm identifier.
        algorithm: String,
        /// Rejected parameter.
        param: String,
    },

    /// Key material has the wrong size or shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature did not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (wrong recipient or tampered ciphertext).
    #[error("decryption failed")]
    Decryption,

    /// A persisted identity could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}
