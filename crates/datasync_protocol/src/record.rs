//! Stored records and change operations.

use crate::key::ObjectKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content hash of a record value.
pub type Checksum = [u8; 32];

/// Computes the checksum of a record value.
pub fn checksum(value: &[u8]) -> Checksum {
    Sha256::digest(value).into()
}

/// One version of a record.
///
/// `version` strictly increases on every local or accepted remote mutation
/// of the key. `checksum` lets peers compare freshness without the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record identity.
    pub key: ObjectKey,
    /// Encoded value.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    /// Record version.
    pub version: u64,
    /// Checksum of `value`.
    pub checksum: Checksum,
}

impl StoredRecord {
    /// Creates a record, computing its checksum.
    pub fn new(key: ObjectKey, value: Vec<u8>, version: u64) -> Self {
        let checksum = checksum(&value);
        Self {
            key,
            value,
            version,
            checksum,
        }
    }

    /// Returns the record with a different version, keeping the value.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

/// What a [`ChangeOperation`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A local write travelling to the server.
    Upload,
    /// A remote change travelling to the local store. `value: None` is a removal.
    Download,
    /// A local removal travelling to the server.
    Remove,
}

/// The unit exchanged between the change controller and the remote connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOperation {
    /// Record identity.
    pub key: ObjectKey,
    /// Direction and meaning.
    pub kind: ChangeKind,
    /// Plain value, absent for removals.
    pub value: Option<Vec<u8>>,
    /// Version being transferred.
    pub version: u64,
}

impl ChangeOperation {
    /// Creates an upload of a written record.
    pub fn upload(record: StoredRecord) -> Self {
        Self {
            key: record.key,
            kind: ChangeKind::Upload,
            value: Some(record.value),
            version: record.version,
        }
    }

    /// Creates an upload of a removal.
    pub fn remove(key: ObjectKey, version: u64) -> Self {
        Self {
            key,
            kind: ChangeKind::Remove,
            value: None,
            version,
        }
    }

    /// Creates an inbound change. `value: None` means the record was removed remotely.
    pub fn download(key: ObjectKey, value: Option<Vec<u8>>, version: u64) -> Self {
        Self {
            key,
            kind: ChangeKind::Download,
            value,
            version,
        }
    }

    /// Returns the checksum of the carried value, if any.
    pub fn checksum(&self) -> Option<Checksum> {
        self.value.as_deref().map(checksum)
    }

    /// Converts into a record if a value is carried.
    pub fn into_record(self) -> Option<StoredRecord> {
        let version = self.version;
        let key = self.key;
        self.value.map(|value| StoredRecord::new(key, value, version))
    }
}
