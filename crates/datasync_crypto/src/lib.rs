//! # Datasync Crypto
//!
//! Per-device keys and the capabilities built on them.
//!
//! Algorithms are addressed on the wire by a [`KeyScheme`] (identifier
//! plus parameter). The [`CryptoRegistry`] turns a scheme and a public key
//! into a capability object:
//!
//! - [`Signer`] / [`Verifier`] - envelope signatures
//! - [`Encryptor`] / [`Decryptor`] - end-to-end payload encryption
//!
//! A [`CryptoIdentity`] owns one signer and one decryptor and can be
//! persisted to a key store.
//!
//! ## Supported algorithms
//!
//! | Purpose | Identifier | Backend |
//! |---|---|---|
//! | Signature | `ed25519` | `ed25519-dalek` |
//! | Encryption | `x25519-xsalsa20poly1305` | `crypto_box` (sealed, ephemeral sender key) |
//!
//! [`KeyScheme`]: datasync_protocol::KeyScheme

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod algorithm;
mod capability;
mod ed25519;
mod error;
mod identity;
mod registry;
mod sealed;

pub use algorithm::{CryptAlgorithm, SignAlgorithm};
pub use capability::{Decryptor, Encryptor, Signer, Verifier};
pub use ed25519::{Ed25519Signer, Ed25519Verifier};
pub use error::{CryptoError, CryptoResult};
pub use identity::{fingerprint, CryptoIdentity};
pub use registry::CryptoRegistry;
pub use sealed::{SealedBoxDecryptor, SealedBoxEncryptor};
