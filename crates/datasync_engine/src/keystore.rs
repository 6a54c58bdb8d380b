//! Persistent device identity.
//!
//! The private keys and the server-issued ids live in their own namespace
//! of the local backend, next to the records they protect.

use crate::error::SyncResult;
use datasync_crypto::{CryptoIdentity, CryptoRegistry};
use datasync_protocol::{from_cbor, to_cbor, KeyScheme};
use datasync_storage::KeyValueBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Namespace holding the identity and device rows.
pub const KEYSTORE_NAMESPACE: &str = "keystore";

const IDENTITY_KEY: &[u8] = b"identity";
const DEVICE_KEY: &[u8] = b"device";

/// Ids issued by the server at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// This device.
    pub device_id: Uuid,
    /// The account it belongs to.
    pub account_id: Uuid,
}

/// Reads and writes the device identity.
#[derive(Clone)]
pub struct Keystore {
    backend: Arc<dyn KeyValueBackend>,
}

impl Keystore {
    /// Creates a keystore over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Loads the stored identity, generating and persisting one on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored identity is unreadable or uses a
    /// scheme `registry` does not enable.
    pub fn load_or_create_identity(
        &self,
        registry: &CryptoRegistry,
        sign_scheme: &KeyScheme,
        crypt_scheme: &KeyScheme,
    ) -> SyncResult<CryptoIdentity> {
        if let Some(bytes) = self.backend.get(KEYSTORE_NAMESPACE, IDENTITY_KEY)? {
            return Ok(CryptoIdentity::from_bytes(registry, &bytes)?);
        }

        let identity = CryptoIdentity::generate(registry, sign_scheme, crypt_scheme)?;
        let bytes = identity.to_bytes()?;
        self.backend
            .put(KEYSTORE_NAMESPACE, IDENTITY_KEY, bytes.to_vec())?;
        self.backend.sync()?;
        info!(fingerprint = %identity.fingerprint(), "generated device identity");
        Ok(identity)
    }

    /// Returns the ids from the last successful registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read or decoded.
    pub fn device(&self) -> SyncResult<Option<DeviceRecord>> {
        self.backend
            .get(KEYSTORE_NAMESPACE, DEVICE_KEY)?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    /// Persists the ids issued at registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn save_device(&self, record: DeviceRecord) -> SyncResult<()> {
        self.backend
            .put(KEYSTORE_NAMESPACE, DEVICE_KEY, to_cbor(&record)?)?;
        self.backend.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_crypto::{CryptAlgorithm, SignAlgorithm};
    use datasync_storage::{FileBackend, InMemoryBackend};
    use tempfile::tempdir;

    fn schemes() -> (KeyScheme, KeyScheme) {
        (
            SignAlgorithm::Ed25519.scheme(),
            CryptAlgorithm::X25519XSalsa20Poly1305.scheme(),
        )
    }

    #[test]
    fn identity_is_generated_once() {
        let keystore = Keystore::new(Arc::new(InMemoryBackend::new()));
        let registry = CryptoRegistry::default();
        let (sign, crypt) = schemes();

        let first = keystore.load_or_create_identity(&registry, &sign, &crypt).unwrap();
        let second = keystore.load_or_create_identity(&registry, &sign, &crypt).unwrap();
        assert_eq!(first.sign_key(), second.sign_key());
        assert_eq!(first.crypt_key(), second.crypt_key());
    }

    #[test]
    fn identity_and_device_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.log");
        let registry = CryptoRegistry::default();
        let (sign, crypt) = schemes();
        let device = DeviceRecord {
            device_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
        };

        let key = {
            let keystore = Keystore::new(Arc::new(FileBackend::open(&path).unwrap()));
            assert_eq!(keystore.device().unwrap(), None);
            keystore.save_device(device).unwrap();
            keystore
                .load_or_create_identity(&registry, &sign, &crypt)
                .unwrap()
                .sign_key()
        };

        let keystore = Keystore::new(Arc::new(FileBackend::open(&path).unwrap()));
        assert_eq!(keystore.device().unwrap(), Some(device));
        let restored = keystore.load_or_create_identity(&registry, &sign, &crypt).unwrap();
        assert_eq!(restored.sign_key(), key);
    }
}
