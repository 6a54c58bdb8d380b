//! Capability traits.

use crate::error::CryptoResult;
use datasync_protocol::KeyScheme;
use zeroize::Zeroizing;

/// Produces envelope signatures with a private signing key.
pub trait Signer: Send + Sync {
    /// Scheme of the key.
    fn scheme(&self) -> KeyScheme;

    /// Public half of the key, as sent in `Register`.
    fn public_key(&self) -> Vec<u8>;

    /// Signs `message`.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Private key bytes for persistence.
    fn secret_bytes(&self) -> Zeroizing<Vec<u8>>;
}

/// Checks signatures against one public key.
pub trait Verifier: Send + Sync {
    /// Scheme of the key.
    fn scheme(&self) -> KeyScheme;

    /// The public key being verified against.
    fn public_key(&self) -> Vec<u8>;

    /// Verifies `signature` over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CryptoError::BadSignature`] if it does not verify.
    fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()>;
}

/// Encrypts payloads for one recipient's public key.
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext` so only the recipient can read it.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Decrypts payloads addressed to the local device.
pub trait Decryptor: Send + Sync {
    /// Scheme of the key.
    fn scheme(&self) -> KeyScheme;

    /// Public half of the key, as sent in `Register`.
    fn public_key(&self) -> Vec<u8>;

    /// Decrypts a payload produced by the matching [`Encryptor`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::CryptoError::Decryption`] for foreign or tampered input.
    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Private key bytes for persistence.
    fn secret_bytes(&self) -> Zeroizing<Vec<u8>>;
}
