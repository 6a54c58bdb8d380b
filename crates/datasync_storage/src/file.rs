//! File-based key-value backend for persistent storage.
//!
//! The file is an append-only log of write batches. Each record is:
//!
//! ```text
//! | len: u32 BE | sha256(payload): 32 bytes | payload: CBOR WriteBatch |
//! ```
//!
//! On open the log is replayed into memory. A record cut short by a crash
//! (the tail of the file) is discarded; a complete record whose digest does
//! not match is reported as corruption.

use crate::backend::KeyValueBackend;
use crate::batch::{get_from, scan_from, Table, WriteBatch};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_LEN: usize = 4 + 32;

#[derive(Debug)]
struct FileState {
    file: File,
    table: Table,
    size: u64,
    records: u64,
}

/// A file-based key-value backend.
///
/// Data survives process restarts. The file is locked exclusively while
/// the backend is open, so two processes cannot append to the same log.
///
/// # Durability
///
/// With `sync_on_write` (the default) every batch is followed by
/// `File::sync_data()`. Without it, durability is deferred to
/// [`KeyValueBackend::sync`].
///
/// # Example
///
/// ```no_run
/// use datasync_storage::{FileBackend, KeyValueBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("device.store")).unwrap();
/// backend.put("records", b"todo/1", b"buy milk".to_vec()).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: RwLock<FileState>,
    sync_on_write: bool,
}

impl FileBackend {
    /// Opens or creates a store at the given path and replays its log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the file,
    /// [`StorageError::Corrupted`] if a complete record fails its digest,
    /// or an I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(path.to_path_buf()))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (table, valid_len, records) = replay(&bytes)?;
        if (valid_len as usize) < bytes.len() {
            warn!(
                path = %path.display(),
                discarded = bytes.len() - valid_len as usize,
                "discarding incomplete record at end of store"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), records, entries = table.len(), "store opened");

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(FileState {
                file,
                table,
                size: valid_len,
                records,
            }),
            sync_on_write: true,
        })
    }

    /// Opens or creates a store, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the store cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Enables or disables syncing after every batch.
    #[must_use]
    pub fn with_sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the log in bytes.
    pub fn file_size(&self) -> u64 {
        self.state.read().size
    }

    /// Returns the number of batch records in the log.
    pub fn record_count(&self) -> u64 {
        self.state.read().records
    }

    /// Returns the number of live entries across all namespaces.
    pub fn entry_count(&self) -> usize {
        self.state.read().table.len()
    }

    /// Rewrites the log as a single snapshot batch of the live entries.
    ///
    /// The snapshot is written to a sibling file, synced, then renamed over
    /// the log, so a crash leaves either the old or the new log in place.
    /// Returns `(bytes_before, bytes_after)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<(u64, u64)> {
        let mut state = self.state.write();
        let before = state.size;

        let mut snapshot = WriteBatch::new();
        for ((namespace, key), value) in &state.table {
            snapshot.put(namespace.clone(), key.clone(), value.clone());
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(tmp_path.clone()))?;

        let after = if snapshot.is_empty() {
            0
        } else {
            let record = encode_record(&snapshot)?;
            tmp.write_all(&record)?;
            record.len() as u64
        };
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        state.file = tmp;
        state.size = after;
        state.records = u64::from(after > 0);
        debug!(path = %self.path.display(), before, after, "store compacted");
        Ok((before, after))
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, namespace: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(get_from(&self.state.read().table, namespace, key))
    }

    fn scan_prefix(
        &self,
        namespace: &str,
        prefix: &[u8],
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_from(&self.state.read().table, namespace, prefix))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let record = encode_record(&batch)?;

        let mut state = self.state.write();
        let offset = state.size;
        state.file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = state.file.write_all(&record) {
            // Leave no partial record behind for the next append.
            let _ = state.file.set_len(offset);
            return Err(e.into());
        }
        if self.sync_on_write {
            state.file.sync_data()?;
        }

        state.size += record.len() as u64;
        state.records += 1;
        batch.apply_to(&mut state.table);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let state = self.state.read();
        state.file.sync_all()?;
        Ok(())
    }
}

fn encode_record(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(batch, &mut payload)
        .map_err(|e| StorageError::Codec(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Codec(format!("batch of {} bytes is too large", payload.len())))?;

    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&Sha256::digest(&payload));
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Replays a log image, returning the table, the length of the valid
/// prefix, and the number of records in it.
fn replay(bytes: &[u8]) -> StorageResult<(Table, u64, u64)> {
    let mut table = Table::new();
    let mut offset = 0usize;
    let mut records = 0u64;

    while bytes.len() - offset >= HEADER_LEN {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        let body_start = offset + HEADER_LEN;
        if bytes.len() - body_start < len {
            break;
        }
        let digest = &bytes[offset + 4..body_start];
        let payload = &bytes[body_start..body_start + len];
        if Sha256::digest(payload).as_slice() != digest {
            return Err(StorageError::Corrupted(format!(
                "digest mismatch in record at offset {offset}"
            )));
        }

        let batch: WriteBatch = ciborium::de::from_reader(payload).map_err(|e| {
            StorageError::Corrupted(format!("undecodable record at offset {offset}: {e}"))
        })?;
        batch.apply_to(&mut table);

        offset = body_start + len;
        records += 1;
    }

    Ok((table, offset as u64, records))
}
