//! Scheme-to-implementation registry.

use crate::algorithm::{CryptAlgorithm, SignAlgorithm};
use crate::capability::{Decryptor, Encryptor, Signer, Verifier};
use crate::ed25519::{Ed25519Signer, Ed25519Verifier};
use crate::error::{CryptoError, CryptoResult};
use crate::sealed::{SealedBoxDecryptor, SealedBoxEncryptor};
use datasync_protocol::KeyScheme;
use std::sync::Arc;

/// The set of algorithms a process accepts, chosen at startup.
///
/// The default registry enables every built-in algorithm.
#[derive(Debug, Clone)]
pub struct CryptoRegistry {
    sign: Vec<SignAlgorithm>,
    crypt: Vec<CryptAlgorithm>,
}

impl Default for CryptoRegistry {
    fn default() -> Self {
        Self {
            sign: vec![SignAlgorithm::Ed25519],
            crypt: vec![CryptAlgorithm::X25519XSalsa20Poly1305],
        }
    }
}

impl CryptoRegistry {
    /// Creates a registry restricted to the given algorithms.
    pub fn new(sign: Vec<SignAlgorithm>, crypt: Vec<CryptAlgorithm>) -> Self {
        Self { sign, crypt }
    }

    /// Returns the preferred signature scheme, announced in `Identify`.
    pub fn preferred_sign_scheme(&self) -> Option<KeyScheme> {
        self.sign.first().map(|a| a.scheme())
    }

    /// Resolves and checks a signature scheme.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] if the scheme is unknown
    /// or disabled in this registry.
    pub fn sign_algorithm(&self, scheme: &KeyScheme) -> CryptoResult<SignAlgorithm> {
        let algorithm = SignAlgorithm::from_scheme(scheme)?;
        if self.sign.contains(&algorithm) {
            Ok(algorithm)
        } else {
            Err(CryptoError::UnsupportedAlgorithm(scheme.algorithm.clone()))
        }
    }

    /// Resolves and checks an encryption scheme.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] if the scheme is unknown
    /// or disabled in this registry.
    pub fn crypt_algorithm(&self, scheme: &KeyScheme) -> CryptoResult<CryptAlgorithm> {
        let algorithm = CryptAlgorithm::from_scheme(scheme)?;
        if self.crypt.contains(&algorithm) {
            Ok(algorithm)
        } else {
            Err(CryptoError::UnsupportedAlgorithm(scheme.algorithm.clone()))
        }
    }

    /// Builds a verifier for a peer's public signing key.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported schemes or malformed keys.
    pub fn verifier(&self, scheme: &KeyScheme, public_key: &[u8]) -> CryptoResult<Arc<dyn Verifier>> {
        match self.sign_algorithm(scheme)? {
            SignAlgorithm::Ed25519 => Ok(Arc::new(Ed25519Verifier::from_public(public_key)?)),
        }
    }

    /// Builds an encryptor for a peer's public encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported schemes or malformed keys.
    pub fn encryptor(
        &self,
        scheme: &KeyScheme,
        public_key: &[u8],
    ) -> CryptoResult<Arc<dyn Encryptor>> {
        match self.crypt_algorithm(scheme)? {
            CryptAlgorithm::X25519XSalsa20Poly1305 => {
                Ok(Arc::new(SealedBoxEncryptor::from_public(public_key)?))
            }
        }
    }

    /// Generates a new private signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not enabled.
    pub fn generate_signer(&self, scheme: &KeyScheme) -> CryptoResult<Box<dyn Signer>> {
        match self.sign_algorithm(scheme)? {
            SignAlgorithm::Ed25519 => Ok(Box::new(Ed25519Signer::generate())),
        }
    }

    /// Generates a new private encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not enabled.
    pub fn generate_decryptor(&self, scheme: &KeyScheme) -> CryptoResult<Box<dyn Decryptor>> {
        match self.crypt_algorithm(scheme)? {
            CryptAlgorithm::X25519XSalsa20Poly1305 => Ok(Box::new(SealedBoxDecryptor::generate())),
        }
    }

    /// Restores a private signing key.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported schemes or malformed key bytes.
    pub fn restore_signer(&self, scheme: &KeyScheme, secret: &[u8]) -> CryptoResult<Box<dyn Signer>> {
        match self.sign_algorithm(scheme)? {
            SignAlgorithm::Ed25519 => Ok(Box::new(Ed25519Signer::from_secret(secret)?)),
        }
    }

    /// Restores a private encryption key.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported schemes or malformed key bytes.
    pub fn restore_decryptor(
        &self,
        scheme: &KeyScheme,
        secret: &[u8],
    ) -> CryptoResult<Box<dyn Decryptor>> {
        match self.crypt_algorithm(scheme)? {
            CryptAlgorithm::X25519XSalsa20Poly1305 => {
                Ok(Box::new(SealedBoxDecryptor::from_secret(secret)?))
            }
        }
    }
}
