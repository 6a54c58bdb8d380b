//! Ed25519 envelope signatures.

use crate::algorithm::SignAlgorithm;
use crate::capability::{Signer, Verifier};
use crate::error::{CryptoError, CryptoResult};
use datasync_protocol::KeyScheme;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Ed25519 private key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Generates a fresh key from the OS random source.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restores a key from its 32 secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if `secret` is not 32 bytes.
    pub fn from_secret(secret: &[u8]) -> CryptoResult<Self> {
        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret
                .try_into()
                .map_err(|_| CryptoError::InvalidKey(format!("ed25519 secret of {} bytes", secret.len())))?,
        );
        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Returns a verifier for this key's public half.
    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier {
            key: self.key.verifying_key(),
        }
    }
}

impl Signer for Ed25519Signer {
    fn scheme(&self) -> KeyScheme {
        SignAlgorithm::Ed25519.scheme()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }

    fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.key.to_bytes().to_vec())
    }
}

/// Ed25519 public key.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Parses a 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for a wrong size or a point not on the curve.
    pub fn from_public(public: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; 32] = public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("ed25519 key of {} bytes", public.len())))?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl Verifier for Ed25519Verifier {
    fn scheme(&self) -> KeyScheme {
        SignAlgorithm::Ed25519.scheme()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.to_bytes().to_vec()
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.key
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}
