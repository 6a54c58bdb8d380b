//! Per-device key material.

use crate::capability::{Decryptor, Encryptor, Signer, Verifier};
use crate::error::{CryptoError, CryptoResult};
use crate::registry::CryptoRegistry;
use datasync_protocol::KeyScheme;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Short, stable, printable identifier of a public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(&Sha256::digest(public_key)[..8])
}

/// Persisted form of an identity. Wiped from memory when dropped.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityRecord {
    sign_algorithm: String,
    sign_param: Option<String>,
    #[serde(with = "serde_bytes")]
    sign_secret: Vec<u8>,
    crypt_algorithm: String,
    crypt_param: Option<String>,
    #[serde(with = "serde_bytes")]
    crypt_secret: Vec<u8>,
}

/// A device's signing keypair and encryption keypair.
pub struct CryptoIdentity {
    signer: Box<dyn Signer>,
    decryptor: Box<dyn Decryptor>,
}

impl CryptoIdentity {
    /// Generates a new identity with the given schemes.
    ///
    /// # Errors
    ///
    /// Returns an error if either scheme is not enabled in `registry`.
    pub fn generate(
        registry: &CryptoRegistry,
        sign_scheme: &KeyScheme,
        crypt_scheme: &KeyScheme,
    ) -> CryptoResult<Self> {
        Ok(Self {
            signer: registry.generate_signer(sign_scheme)?,
            decryptor: registry.generate_decryptor(crypt_scheme)?,
        })
    }

    /// Scheme of the signing key.
    pub fn sign_scheme(&self) -> KeyScheme {
        self.signer.scheme()
    }

    /// Public signing key.
    pub fn sign_key(&self) -> Vec<u8> {
        self.signer.public_key()
    }

    /// Scheme of the encryption key.
    pub fn crypt_scheme(&self) -> KeyScheme {
        self.decryptor.scheme()
    }

    /// Public encryption key.
    pub fn crypt_key(&self) -> Vec<u8> {
        self.decryptor.public_key()
    }

    /// Signs `message` with the private signing key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signer.sign(message)
    }

    /// Decrypts a payload sealed for this device.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] for foreign or tampered input.
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.decryptor.decrypt(ciphertext)
    }

    /// Returns a verifier for this device's own signatures.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not enabled in `registry`.
    pub fn verifier(&self, registry: &CryptoRegistry) -> CryptoResult<Arc<dyn Verifier>> {
        registry.verifier(&self.sign_scheme(), &self.sign_key())
    }

    /// Returns an encryptor addressing this device.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme is not enabled in `registry`.
    pub fn encryptor(&self, registry: &CryptoRegistry) -> CryptoResult<Arc<dyn Encryptor>> {
        registry.encryptor(&self.crypt_scheme(), &self.crypt_key())
    }

    /// Fingerprint of the public signing key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sign_key())
    }

    /// Serializes the private keys for a key store.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Codec`] if encoding fails.
    pub fn to_bytes(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let sign = self.signer.scheme();
        let crypt = self.decryptor.scheme();
        let record = IdentityRecord {
            sign_algorithm: sign.algorithm,
            sign_param: sign.param,
            sign_secret: self.signer.secret_bytes().to_vec(),
            crypt_algorithm: crypt.algorithm,
            crypt_param: crypt.param,
            crypt_secret: self.decryptor.secret_bytes().to_vec(),
        };
        let mut buf = Zeroizing::new(Vec::new());
        ciborium::ser::into_writer(&record, &mut *buf)
            .map_err(|e| CryptoError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Restores an identity written by [`CryptoIdentity::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input or schemes not enabled in `registry`.
    pub fn from_bytes(registry: &CryptoRegistry, bytes: &[u8]) -> CryptoResult<Self> {
        let record: IdentityRecord =
            ciborium::de::from_reader(bytes).map_err(|e| CryptoError::Codec(e.to_string()))?;
        let sign = KeyScheme::new(record.sign_algorithm.clone(), record.sign_param.clone());
        let crypt = KeyScheme::new(record.crypt_algorithm.clone(), record.crypt_param.clone());
        Ok(Self {
            signer: registry.restore_signer(&sign, &record.sign_secret)?,
            decryptor: registry.restore_decryptor(&crypt, &record.crypt_secret)?,
        })
    }
}

impl std::fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field("sign_scheme", &self.sign_scheme())
            .field("crypt_scheme", &self.crypt_scheme())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{CryptAlgorithm, SignAlgorithm};

    fn identity(registry: &CryptoRegistry) -> CryptoIdentity {
        CryptoIdentity::generate(
            registry,
            &SignAlgorithm::Ed25519.scheme(),
            &CryptAlgorithm::X25519XSalsa20Poly1305.scheme(),
        )
        .unwrap()
    }

    #[test]
    fn persisted_identity_keeps_its_keys() {
        let registry = CryptoRegistry::default();
        let original = identity(&registry);
        let bytes = original.to_bytes().unwrap();
        let restored = CryptoIdentity::from_bytes(&registry, &bytes).unwrap();

        assert_eq!(restored.sign_key(), original.sign_key());
        assert_eq!(restored.crypt_key(), original.crypt_key());
        assert_eq!(restored.fingerprint(), original.fingerprint());

        let verifier = original.verifier(&registry).unwrap();
        assert!(verifier.verify(b"nonce", &restored.sign(b"nonce")).is_ok());

        let sealed = original.encryptor(&registry).unwrap().encrypt(b"v").unwrap();
        assert_eq!(restored.decrypt(&sealed).unwrap(), b"v".to_vec());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let registry = CryptoRegistry::default();
        let id = identity(&registry);
        let debug = format!("{id:?}");
        assert!(debug.contains(&id.fingerprint()));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn garbage_identity_is_rejected() {
        let registry = CryptoRegistry::default();
        assert!(matches!(
            CryptoIdentity::from_bytes(&registry, &[0xFF, 0x01]),
            Err(CryptoError::Codec(_))
        ));
    }

    #[test]
    fn fingerprints_differ_between_keys() {
        let registry = CryptoRegistry::default();
        assert_ne!(identity(&registry).fingerprint(), identity(&registry).fingerprint());
        assert_eq!(fingerprint(b"k").len(), 16);
    }
}
