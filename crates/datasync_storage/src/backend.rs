//! Key-value backend trait definition.

use crate::batch::WriteBatch;
use crate::error::StorageResult;

/// A namespaced key-value store.
///
/// # Invariants
///
/// - `write` applies every operation of a batch or none of them
/// - `get` and `scan_prefix` never observe a partially applied batch
/// - `scan_prefix` returns entries in ascending key order
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait KeyValueBackend: Send + Sync {
    /// Reads the value stored under `key` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, namespace: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns all entries of `namespace` whose key starts with `prefix`.
    ///
    /// An empty prefix returns the whole namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn scan_prefix(&self, namespace: &str, prefix: &[u8])
        -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically applies a batch of writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be made durable. On error no
    /// operation of the batch is visible.
    fn write(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Flushes all written batches to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Stores a single value.
    ///
    /// # Errors
    ///
    /// See [`KeyValueBackend::write`].
    fn put(&self, namespace: &str, key: &[u8], value: Vec<u8>) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(namespace, key.to_vec(), value);
        self.write(batch)
    }

    /// Deletes a single value. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// See [`KeyValueBackend::write`].
    fn delete(&self, namespace: &str, key: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(namespace, key.to_vec());
        self.write(batch)
    }
}
