//! Persistent server state.
//!
//! All rows live in a [`KeyValueBackend`] under these namespaces:
//!
//! | Namespace     | Key                     | Value                         |
//! |---------------|-------------------------|-------------------------------|
//! | `meta`        | `schema_version`        | `u32` BE                      |
//! | `devices`     | device id               | [`DeviceRow`]                 |
//! | `device_keys` | SHA-256 of signing key  | device id                     |
//! | `accounts`    | account id ‖ device id  | empty                         |
//! | `data_index`  | account id ‖ object key | [`IndexEntry`]                |
//! | `outbox`      | device id ‖ object key  | [`OutboxEntry`]               |

use crate::error::{ServerError, ServerResult};
use datasync_protocol::{
    from_cbor, to_cbor, ChangeKind, ChangeMessage, Checksum, DeviceInfo, Frame, KeyScheme,
    ObjectKey, Register,
};
use datasync_storage::{KeyValueBackend, WriteBatch};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Schema version written by this server.
pub const SCHEMA_VERSION: u32 = 1;

const META: &str = "meta";
const DEVICES: &str = "devices";
const DEVICE_KEYS: &str = "device_keys";
const ACCOUNTS: &str = "accounts";
const DATA_INDEX: &str = "data_index";
const OUTBOX: &str = "outbox";

const SCHEMA_KEY: &[u8] = b"schema_version";

/// A registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    /// Issued device id.
    pub device_id: Uuid,
    /// Account the device belongs to.
    pub account_id: Uuid,
    /// Name given at registration.
    pub device_name: String,
    /// Signature scheme.
    pub sign_scheme: KeyScheme,
    /// Public signing key.
    #[serde(with = "serde_bytes")]
    pub sign_key: Vec<u8>,
    /// Encryption scheme.
    pub crypt_scheme: KeyScheme,
    /// Public encryption key.
    #[serde(with = "serde_bytes")]
    pub crypt_key: Vec<u8>,
}

impl DeviceRow {
    /// Public part sent to the other devices.
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id,
            device_name: self.device_name.clone(),
            sign_scheme: self.sign_scheme.clone(),
            sign_key: self.sign_key.clone(),
            crypt_scheme: self.crypt_scheme.clone(),
            crypt_key: self.crypt_key.clone(),
        }
    }
}

/// Last accepted version of a key within an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Accepted version.
    pub version: u64,
    /// Checksum of the plain value, absent for removals.
    pub checksum: Option<Checksum>,
    /// True while some device has not acknowledged this version.
    pub changed: bool,
    /// The accepted signed `Change` frame.
    pub frame: Frame,
}

/// A change queued for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Version of the queued change.
    pub version: u64,
    /// The signed `Change` frame to relay.
    pub frame: Frame,
}

/// Result of indexing an uploaded change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The change is the account's new state; relay it to `recipients`.
    Accepted {
        /// Other devices of the account.
        recipients: Vec<Uuid>,
    },
    /// A newer version is already indexed, or the upload was sealed for
    /// an outdated device list. The uploader must retry above
    /// `server_version`.
    Conflict {
        /// Version the retry must exceed.
        server_version: u64,
        /// Indexed frame, if any.
        current: Option<Frame>,
    },
}

/// Device registry, per-account data index and per-device outboxes.
pub struct DatabaseController {
    backend: Arc<dyn KeyValueBackend>,
    schema: RwLock<Option<u32>>,
    registration: Mutex<()>,
    account_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DatabaseController {
    /// Opens the database, creating the schema on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or holds a newer schema.
    pub fn open(backend: Arc<dyn KeyValueBackend>) -> ServerResult<Self> {
        let db = Self {
            backend,
            schema: RwLock::new(None),
            registration: Mutex::new(()),
            account_locks: Mutex::new(HashMap::new()),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Creates the schema if missing and checks its version.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Schema`] for an unsupported version.
    pub fn ensure_schema(&self) -> ServerResult<u32> {
        if let Some(version) = *self.schema.read() {
            return Ok(version);
        }

        let mut schema = self.schema.write();
        let version = match self.backend.get(META, SCHEMA_KEY)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| ServerError::Schema {
                    found: 0,
                    expected: SCHEMA_VERSION,
                })?;
                u32::from_be_bytes(raw)
            }
            None => {
                self.backend
                    .put(META, SCHEMA_KEY, SCHEMA_VERSION.to_be_bytes().to_vec())?;
                self.backend.sync()?;
                info!(version = SCHEMA_VERSION, "database schema created");
                SCHEMA_VERSION
            }
        };
        if version != SCHEMA_VERSION {
            return Err(ServerError::Schema {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }
        *schema = Some(version);
        Ok(version)
    }

    /// Registers a device, or returns the existing device for a known
    /// signing key.
    ///
    /// `account: None` creates a new account.
    ///
    /// # Errors
    ///
    /// Returns a client error for an unknown account, or for a known key
    /// claiming a different account.
    pub fn add_device(&self, register: &Register) -> ServerResult<DeviceRow> {
        let _guard = self.registration.lock();
        let key_hash = Sha256::digest(&register.sign_key).to_vec();

        if let Some(id) = self.backend.get(DEVICE_KEYS, &key_hash)? {
            let device_id = uuid_from(&id)?;
            let row = self
                .device(device_id)?
                .ok_or_else(|| ServerError::Internal(format!("dangling key for {device_id}")))?;
            if let Some(account) = register.account {
                if account != row.account_id {
                    return Err(ServerError::Client(format!(
                        "device {device_id} belongs to another account"
                    )));
                }
            }
            debug!(%device_id, "device re-registered");
            return Ok(row);
        }

        let account_id = match register.account {
            Some(account) if self.account_exists(account)? => account,
            Some(account) => {
                return Err(ServerError::Client(format!("unknown account {account}")));
            }
            None => Uuid::new_v4(),
        };
        let row = DeviceRow {
            device_id: Uuid::new_v4(),
            account_id,
            device_name: register.device_name.clone(),
            sign_scheme: register.sign_scheme.clone(),
            sign_key: register.sign_key.clone(),
            crypt_scheme: register.crypt_scheme.clone(),
            crypt_key: register.crypt_key.clone(),
        };

        let mut batch = WriteBatch::new();
        batch.put(DEVICES, row.device_id.as_bytes().to_vec(), to_cbor(&row)?);
        batch.put(DEVICE_KEYS, key_hash, row.device_id.as_bytes().to_vec());
        batch.put(ACCOUNTS, pair_key(account_id, row.device_id.as_bytes()), Vec::new());
        self.backend.write(batch)?;
        self.backend.sync()?;

        info!(
            device_id = %row.device_id,
            %account_id,
            name = %row.device_name,
            new_account = register.account.is_none(),
            "device registered"
        );
        Ok(row)
    }

    /// Looks up a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read.
    pub fn device(&self, device_id: Uuid) -> ServerResult<Option<DeviceRow>> {
        self.backend
            .get(DEVICES, device_id.as_bytes())?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    /// Returns true if the account has at least one device.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn account_exists(&self, account_id: Uuid) -> ServerResult<bool> {
        Ok(!self
            .backend
            .scan_prefix(ACCOUNTS, account_id.as_bytes())?
            .is_empty())
    }

    /// All devices of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn devices_of(&self, account_id: Uuid) -> ServerResult<Vec<DeviceRow>> {
        let mut devices = Vec::new();
        for (key, _) in self.backend.scan_prefix(ACCOUNTS, account_id.as_bytes())? {
            let device_id = uuid_from(pair_tail(&key)?)?;
            if let Some(row) = self.device(device_id)? {
                devices.push(row);
            }
        }
        Ok(devices)
    }

    /// Number of registered devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn device_count(&self) -> ServerResult<usize> {
        Ok(self.backend.scan_prefix(DEVICES, &[])?.len())
    }

    /// Number of accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn account_count(&self) -> ServerResult<usize> {
        let mut accounts = self
            .backend
            .scan_prefix(ACCOUNTS, &[])?
            .into_iter()
            .map(|(key, _)| uuid_from(key.get(..16).unwrap_or(key.as_slice())))
            .collect::<ServerResult<Vec<Uuid>>>()?;
        accounts.dedup();
        Ok(accounts.len())
    }

    /// Runs `f` while holding the account's lock.
    ///
    /// Changes of one account are indexed and relayed one at a time so all
    /// devices observe them in the same order.
    pub fn with_account_lock<R>(&self, account_id: Uuid, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(
            self.account_locks
                .lock()
                .entry(account_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        let _guard = lock.lock();
        f()
    }

    /// Indexes an uploaded change and queues it for the other devices.
    ///
    /// An upload whose version is older than the indexed one is rejected,
    /// as is an upload missing the payload of some account device. Call
    /// under [`DatabaseController::with_account_lock`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn index_change(
        &self,
        account_id: Uuid,
        frame: &Frame,
        change: &ChangeMessage,
    ) -> ServerResult<IndexOutcome> {
        let index_key = pair_key(account_id, &change.key.to_bytes());
        let indexed = self.index_row(&index_key)?;
        if let Some(current) = &indexed {
            if current.version > change.version {
                return Ok(IndexOutcome::Conflict {
                    server_version: current.version,
                    current: Some(current.frame.clone()),
                });
            }
        }

        let recipients: Vec<Uuid> = self
            .devices_of(account_id)?
            .into_iter()
            .map(|d| d.device_id)
            .filter(|id| *id != change.sender)
            .collect();

        if change.kind != ChangeKind::Remove {
            if let Some(missing) = recipients.iter().find(|r| change.payload_for(**r).is_none()) {
                debug!(
                    %account_id,
                    key = %change.key,
                    device_id = %missing,
                    "upload lacks a payload for an account device"
                );
                return Ok(IndexOutcome::Conflict {
                    server_version: change.version,
                    current: indexed.map(|entry| entry.frame),
                });
            }
        }

        let entry = IndexEntry {
            version: change.version,
            checksum: change.checksum,
            changed: !recipients.is_empty(),
            frame: frame.clone(),
        };
        let queued = to_cbor(&OutboxEntry {
            version: change.version,
            frame: frame.clone(),
        })?;

        let mut batch = WriteBatch::new();
        batch.put(DATA_INDEX, index_key, to_cbor(&entry)?);
        for recipient in &recipients {
            batch.put(OUTBOX, pair_key(*recipient, &change.key.to_bytes()), queued.clone());
        }
        self.backend.write(batch)?;

        debug!(
            %account_id,
            key = %change.key,
            version = change.version,
            recipients = recipients.len(),
            "change indexed"
        );
        Ok(IndexOutcome::Accepted { recipients })
    }

    /// The indexed state of a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read.
    pub fn index_entry(&self, account_id: Uuid, key: &ObjectKey) -> ServerResult<Option<IndexEntry>> {
        self.index_row(&pair_key(account_id, &key.to_bytes()))
    }

    /// Changes queued for a device, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if a row cannot be read.
    pub fn pending_downloads(&self, device_id: Uuid) -> ServerResult<Vec<(ObjectKey, OutboxEntry)>> {
        self.backend
            .scan_prefix(OUTBOX, device_id.as_bytes())?
            .into_iter()
            .map(|(key, value)| -> ServerResult<(ObjectKey, OutboxEntry)> {
                let object = ObjectKey::from_bytes(pair_tail(&key)?)?;
                Ok((object, from_cbor(&value)?))
            })
            .collect()
    }

    /// Removes a queued change once the device applied it.
    ///
    /// A newer queued version is kept. When no device of the account still
    /// holds the key, the index entry is marked unchanged. Returns true if
    /// an entry was removed. Takes the account lock itself, so it must not
    /// be called under [`DatabaseController::with_account_lock`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn acknowledge(
        &self,
        account_id: Uuid,
        device_id: Uuid,
        key: &ObjectKey,
        version: u64,
    ) -> ServerResult<bool> {
        self.with_account_lock(account_id, || {
            self.acknowledge_locked(account_id, device_id, key, version)
        })
    }

    fn acknowledge_locked(
        &self,
        account_id: Uuid,
        device_id: Uuid,
        key: &ObjectKey,
        version: u64,
    ) -> ServerResult<bool> {
        let key_bytes = key.to_bytes();
        let outbox_key = pair_key(device_id, &key_bytes);
        let Some(bytes) = self.backend.get(OUTBOX, &outbox_key)? else {
            return Ok(false);
        };
        let queued: OutboxEntry = from_cbor(&bytes)?;
        if queued.version > version {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.delete(OUTBOX, outbox_key);

        let mut still_queued = false;
        for device in self.devices_of(account_id)? {
            if device.device_id != device_id
                && self
                    .backend
                    .get(OUTBOX, &pair_key(device.device_id, &key_bytes))?
                    .is_some()
            {
                still_queued = true;
                break;
            }
        }
        let index_key = pair_key(account_id, &key_bytes);
        if !still_queued {
            if let Some(mut entry) = self.index_row(&index_key)? {
                if entry.changed {
                    entry.changed = false;
                    batch.put(DATA_INDEX, index_key, to_cbor(&entry)?);
                }
            }
        }
        self.backend.write(batch)?;
        Ok(true)
    }

    fn index_row(&self, index_key: &[u8]) -> ServerResult<Option<IndexEntry>> {
        self.backend
            .get(DATA_INDEX, index_key)?
            .map(|bytes| from_cbor(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}

fn pair_key(id: Uuid, rest: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + rest.len());
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(rest);
    key
}

fn pair_tail(key: &[u8]) -> ServerResult<&[u8]> {
    key.get(16..)
        .ok_or_else(|| ServerError::Internal(format!("short key in database: {} bytes", key.len())))
}

fn uuid_from(bytes: &[u8]) -> ServerResult<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| ServerError::Internal(format!("bad id in database: {e}")))
}
