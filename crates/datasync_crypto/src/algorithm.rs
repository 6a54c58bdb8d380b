//! Algorithm identifiers and their parameters.

use crate::error::{CryptoError, CryptoResult};
use datasync_protocol::KeyScheme;
use std::fmt;

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignAlgorithm {
    /// Ed25519 (RFC 8032).
    Ed25519,
}

impl SignAlgorithm {
    /// Wire identifier.
    pub fn id(self) -> &'static str {
        match self {
            SignAlgorithm::Ed25519 => "ed25519",
        }
    }

    /// Parameter used when a scheme names the algorithm without one.
    pub fn default_param(self) -> Option<&'static str> {
        match self {
            SignAlgorithm::Ed25519 => None,
        }
    }

    /// Returns the scheme announcing this algorithm with its default parameter.
    pub fn scheme(self) -> KeyScheme {
        KeyScheme::new(self.id(), self.default_param().map(str::to_string))
    }

    /// Resolves a wire scheme.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown identifiers or parameters the
    /// algorithm does not take.
    pub fn from_scheme(scheme: &KeyScheme) -> CryptoResult<Self> {
        let algorithm = match scheme.algorithm.as_str() {
            "ed25519" => SignAlgorithm::Ed25519,
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        };
        check_param(&scheme.algorithm, scheme.param.as_deref(), algorithm.default_param())?;
        Ok(algorithm)
    }
}

impl fmt::Display for SignAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Supported payload encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptAlgorithm {
    /// X25519 key agreement with XSalsa20-Poly1305, sealed to the recipient.
    X25519XSalsa20Poly1305,
}

impl CryptAlgorithm {
    /// Wire identifier.
    pub fn id(self) -> &'static str {
        match self {
            CryptAlgorithm::X25519XSalsa20Poly1305 => "x25519-xsalsa20poly1305",
        }
    }

    /// Parameter used when a scheme names the algorithm without one.
    pub fn default_param(self) -> Option<&'static str> {
        match self {
            CryptAlgorithm::X25519XSalsa20Poly1305 => Some("curve25519"),
        }
    }

    /// Returns the scheme announcing this algorithm with its default parameter.
    pub fn scheme(self) -> KeyScheme {
        KeyScheme::new(self.id(), self.default_param().map(str::to_string))
    }

    /// Resolves a wire scheme.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown identifiers or parameters the
    /// algorithm does not take.
    pub fn from_scheme(scheme: &KeyScheme) -> CryptoResult<Self> {
        let algorithm = match scheme.algorithm.as_str() {
            "x25519-xsalsa20poly1305" => CryptAlgorithm::X25519XSalsa20Poly1305,
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        };
        check_param(&scheme.algorithm, scheme.param.as_deref(), algorithm.default_param())?;
        Ok(algorithm)
    }
}

impl fmt::Display for CryptAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn check_param(algorithm: &str, given: Option<&str>, expected: Option<&str>) -> CryptoResult<()> {
    match given {
        None => Ok(()),
        Some(param) if Some(param) == expected => Ok(()),
        Some(param) => Err(CryptoError::InvalidParam {
            algorithm: algorithm.to_string(),
            param: param.to_string(),
        }),
    }
}
