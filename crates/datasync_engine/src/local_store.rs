//! Durable record table.
//!
//! Every mutation writes the record row and its change-log row in one
//! [`WriteBatch`], so the change log never disagrees with the records
//! after a crash. Removed records stay behind as tombstones carrying their
//! last version, which keeps versions strictly increasing across
//! remove/re-create cycles.

use crate::change_log::ChangeLog;
use crate::error::{SyncError, SyncResult};
use datasync_protocol::{checksum, from_cbor, to_cbor, ChangeState, Checksum, ObjectKey, StoredRecord};
use datasync_storage::{KeyValueBackend, WriteBatch};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Namespace holding record rows.
pub const RECORDS_NAMESPACE: &str = "records";

#[derive(Debug, Serialize, Deserialize)]
struct RecordRow {
    #[serde(with = "serde_bytes")]
    value: Option<Vec<u8>>,
    version: u64,
    checksum: Option<Checksum>,
}

/// A record row as stored, including tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// Record identity.
    pub key: ObjectKey,
    /// Value, `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// Current version.
    pub version: u64,
    /// Checksum of `value`.
    pub checksum: Option<Checksum>,
}

impl RecordEntry {
    /// Returns true if the record was removed.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns the live record, if any.
    pub fn to_record(&self) -> Option<StoredRecord> {
        self.value.as_ref().map(|value| StoredRecord {
            key: self.key.clone(),
            value: value.clone(),
            version: self.version,
            checksum: self.checksum.unwrap_or_else(|| checksum(value)),
        })
    }
}

/// Per-type statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeSummary {
    /// Type name.
    pub type_name: String,
    /// Live records.
    pub records: usize,
    /// Tombstones.
    pub tombstones: usize,
}

/// Durable mapping `ObjectKey -> (value, version, checksum)`.
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
    change_log: ChangeLog,
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            change_log: ChangeLog::new(Arc::clone(&backend)),
            backend,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the change log updated by this store.
    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Writes `value`, bumps the version, and marks the key `Changed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn save(&self, key: &ObjectKey, value: Vec<u8>) -> SyncResult<StoredRecord> {
        self.transaction(|txn| {
            let version = txn.entry(key)?.map_or(0, |e| e.version) + 1;
            let record = StoredRecord::new(key.clone(), value, version);
            txn.write_record(&record)?;
            txn.set_change_state(key, ChangeState::Changed);
            trace!(%key, version, "record saved");
            Ok(record)
        })
    }

    /// Returns the value of a live record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(&self, key: &ObjectKey) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entry(key)?.and_then(|e| e.value))
    }

    /// Returns a live record with its version and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn record(&self, key: &ObjectKey) -> SyncResult<Option<StoredRecord>> {
        Ok(self.entry(key)?.and_then(|e| e.to_record()))
    }

    /// Returns the stored row, including tombstones.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn entry(&self, key: &ObjectKey) -> SyncResult<Option<RecordEntry>> {
        read_entry(self.backend.as_ref(), key)
    }

    /// Removes a live record, leaving a tombstone marked `Deleted`.
    ///
    /// Returns false if there was nothing to remove.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn remove(&self, key: &ObjectKey) -> SyncResult<bool> {
        self.transaction(|txn| match txn.entry(key)? {
            Some(entry) if !entry.is_tombstone() => {
                let version = entry.version + 1;
                txn.write_tombstone(key, version)?;
                txn.set_change_state(key, ChangeState::Deleted);
                trace!(%key, version, "record removed");
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    /// Returns the values of all live records of a type, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load_all(&self, type_name: &[u8]) -> SyncResult<Vec<Vec<u8>>> {
        Ok(self
            .entries(type_name)?
            .into_iter()
            .filter_map(|e| e.value)
            .collect())
    }

    /// Returns the ids of all live records of a type, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn keys(&self, type_name: &[u8]) -> SyncResult<Vec<String>> {
        Ok(self
            .entries(type_name)?
            .into_iter()
            .filter(|e| !e.is_tombstone())
            .map(|e| e.key.id)
            .collect())
    }

    /// Returns the number of live records of a type.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn count(&self, type_name: &[u8]) -> SyncResult<usize> {
        Ok(self
            .entries(type_name)?
            .iter()
            .filter(|e| !e.is_tombstone())
            .count())
    }

    /// Marks every record of a type pending, forcing a full re-upload.
    ///
    /// Returns the number of keys marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn resync(&self, type_name: &[u8]) -> SyncResult<usize> {
        self.transaction(|txn| {
            let entries = txn.store.entries(type_name)?;
            for entry in &entries {
                let state = if entry.is_tombstone() {
                    ChangeState::Deleted
                } else {
                    ChangeState::Changed
                };
                txn.set_change_state(&entry.key, state);
            }
            Ok(entries.len())
        })
    }

    /// Returns live record and tombstone counts per type.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn type_summaries(&self) -> SyncResult<Vec<TypeSummary>> {
        let mut by_type: BTreeMap<String, TypeSummary> = BTreeMap::new();
        for (key, value) in self.backend.scan_prefix(RECORDS_NAMESPACE, &[])? {
            let entry = decode_entry(&key, &value)?;
            let type_name = entry.key.type_name_lossy().into_owned();
            let summary = by_type.entry(type_name.clone()).or_insert_with(|| TypeSummary {
                type_name,
                ..TypeSummary::default()
            });
            if entry.is_tombstone() {
                summary.tombstones += 1;
            } else {
                summary.records += 1;
            }
        }
        Ok(by_type.into_values().collect())
    }

    /// Runs `f` with exclusive write access, committing its staged writes
    /// as one batch if it succeeds.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` (nothing is written) or of the commit.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let _guard = self.write_lock.lock();
        let mut txn = StoreTxn {
            store: self,
            batch: WriteBatch::new(),
        };
        let result = f(&mut txn)?;
        if !txn.batch.is_empty() {
            self.backend.write(txn.batch)?;
        }
        Ok(result)
    }

    fn entries(&self, type_name: &[u8]) -> SyncResult<Vec<RecordEntry>> {
        self.backend
            .scan_prefix(RECORDS_NAMESPACE, &ObjectKey::type_prefix(type_name))?
            .iter()
            .map(|(key, value)| decode_entry(key, value))
            .collect()
    }
}

/// Staged writes against a [`LocalStore`], committed atomically.
///
/// Reads go to the committed state; they do not see writes staged in the
/// same transaction.
pub struct StoreTxn<'a> {
    store: &'a LocalStore,
    batch: WriteBatch,
}

impl StoreTxn<'_> {
    /// Reads the committed row of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn entry(&self, key: &ObjectKey) -> SyncResult<Option<RecordEntry>> {
        self.store.entry(key)
    }

    /// Reads the committed change state of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the change log cannot be read.
    pub fn change_state(&self, key: &ObjectKey) -> SyncResult<ChangeState> {
        self.store.change_log.state(key)
    }

    /// Stages a live record.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be encoded.
    pub fn write_record(&mut self, record: &StoredRecord) -> SyncResult<()> {
        let row = RecordRow {
            value: Some(record.value.clone()),
            version: record.version,
            checksum: Some(record.checksum),
        };
        self.batch
            .put(RECORDS_NAMESPACE, record.key.to_bytes(), encode_row(&row)?);
        Ok(())
    }

    /// Stages a tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be encoded.
    pub fn write_tombstone(&mut self, key: &ObjectKey, version: u64) -> SyncResult<()> {
        let row = RecordRow {
            value: None,
            version,
            checksum: None,
        };
        self.batch
            .put(RECORDS_NAMESPACE, key.to_bytes(), encode_row(&row)?);
        Ok(())
    }

    /// Stages a change-log update. `Unchanged` deletes the row.
    pub fn set_change_state(&mut self, key: &ObjectKey, state: ChangeState) {
        ChangeLog::stage(&mut self.batch, key, state);
    }
}

fn encode_row(row: &RecordRow) -> SyncResult<Vec<u8>> {
    to_cbor(row).map_err(|e| SyncError::Codec(e.to_string()))
}

fn read_entry(backend: &dyn KeyValueBackend, key: &ObjectKey) -> SyncResult<Option<RecordEntry>> {
    match backend.get(RECORDS_NAMESPACE, &key.to_bytes())? {
        Some(bytes) => {
            let row: RecordRow = from_cbor(&bytes)
                .map_err(|e| SyncError::CorruptState(format!("record {key}: {e}")))?;
            Ok(Some(RecordEntry {
                key: key.clone(),
                value: row.value,
                version: row.version,
                checksum: row.checksum,
            }))
        }
        None => Ok(None),
    }
}

fn decode_entry(key: &[u8], value: &[u8]) -> SyncResult<RecordEntry> {
    let key = ObjectKey::from_bytes(key)
        .map_err(|e| SyncError::CorruptState(format!("record key: {e}")))?;
    let row: RecordRow =
        from_cbor(value).map_err(|e| SyncError::CorruptState(format!("record {key}: {e}")))?;
    Ok(RecordEntry {
        key,
        value: row.value,
        version: row.version,
        checksum: row.checksum,
    })
}
