//! Sealed-box payload encryption.
//!
//! Each payload is sealed with a fresh ephemeral X25519 key, so the sender
//! needs only the recipient's public key. Layout:
//!
//! ```text
//! | ephemeral public key: 32 | nonce: 24 | XSalsa20-Poly1305 ciphertext |
//! ```
//!
//! Sender authenticity comes from the envelope signature over the frame
//! that carries the ciphertext.

use crate::algorithm::CryptAlgorithm;
use crate::capability::{Decryptor, Encryptor};
use crate::error::{CryptoError, CryptoResult};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use datasync_protocol::KeyScheme;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Encrypts for one recipient public key.
#[derive(Debug, Clone)]
pub struct SealedBoxEncryptor {
    recipient: PublicKey,
}

impl SealedBoxEncryptor {
    /// Parses a 32-byte recipient public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for a wrong size.
    pub fn from_public(public: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_LEN] = public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("x25519 key of {} bytes", public.len())))?;
        Ok(Self {
            recipient: PublicKey::from(bytes),
        })
    }
}

impl Encryptor for SealedBoxEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let ephemeral = SecretKey::generate(&mut OsRng);
        let sealed = SalsaBox::new(&self.recipient, &ephemeral);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = sealed
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ephemeral.public_key().as_bytes());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// The local device's encryption key.
pub struct SealedBoxDecryptor {
    secret: SecretKey,
}

impl SealedBoxDecryptor {
    /// Generates a fresh key from the OS random source.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    /// Restores a key from its 32 secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if `secret` is not 32 bytes.
    pub fn from_secret(secret: &[u8]) -> CryptoResult<Self> {
        let bytes: Zeroizing<[u8; KEY_LEN]> = Zeroizing::new(
            secret
                .try_into()
                .map_err(|_| CryptoError::InvalidKey(format!("x25519 secret of {} bytes", secret.len())))?,
        );
        Ok(Self {
            secret: SecretKey::from(*bytes),
        })
    }

    /// Returns an encryptor addressing this key.
    pub fn encryptor(&self) -> SealedBoxEncryptor {
        SealedBoxEncryptor {
            recipient: self.secret.public_key(),
        }
    }
}

impl Decryptor for SealedBoxDecryptor {
    fn scheme(&self) -> KeyScheme {
        CryptAlgorithm::X25519XSalsa20Poly1305.scheme()
    }

    fn public_key(&self) -> Vec<u8> {
        self.secret.public_key().as_bytes().to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < KEY_LEN + NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let (ephemeral, rest) = ciphertext.split_at(KEY_LEN);
        let (nonce, body) = rest.split_at(NONCE_LEN);

        let ephemeral: [u8; KEY_LEN] = ephemeral.try_into().map_err(|_| CryptoError::Decryption)?;
        let sealed = SalsaBox::new(&PublicKey::from(ephemeral), &self.secret);
        sealed
            .decrypt(GenericArray::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decryption)
    }

    fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }
}
