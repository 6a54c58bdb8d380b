//! In-memory key-value backend for testing.

use crate::backend::KeyValueBackend;
use crate::batch::{get_from, scan_from, Table, WriteBatch};
use crate::error::StorageResult;
use parking_lot::RwLock;

/// An in-memory key-value backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral stores that don't need persistence
///
/// # Example
///
/// ```rust
/// use datasync_storage::{InMemoryBackend, KeyValueBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("ns", b"key", b"value".to_vec()).unwrap();
/// assert_eq!(backend.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    table: RwLock<Table>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries across all namespaces.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.table.write().clear();
    }
}

impl KeyValueBackend for InMemoryBackend {
    fn get(&self, namespace: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(get_from(&self.table.read(), namespace, key))
    }

    fn scan_prefix(
        &self,
        namespace: &str,
        prefix: &[u8],
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_from(&self.table.read(), namespace, prefix))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        batch.apply_to(&mut self.table.write());
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing to flush
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn memory_put_get_delete() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());

        backend.put("ns", b"a", b"1".to_vec()).unwrap();
        assert_eq!(backend.get("ns", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("other", b"a").unwrap(), None);

        backend.delete("ns", b"a").unwrap();
        assert_eq!(backend.get("ns", b"a").unwrap(), None);

        // Deleting twice is fine
        backend.delete("ns", b"a").unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn memory_batch_is_visible_as_a_whole() {
        let backend = Arc::new(InMemoryBackend::new());
        let writer = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    let mut batch = WriteBatch::new();
                    batch.put("records", i.to_be_bytes().to_vec(), vec![1]);
                    batch.put("changes", i.to_be_bytes().to_vec(), vec![1]);
                    backend.write(batch).unwrap();
                }
            })
        };

        for _ in 0..200 {
            // Snapshot both tables under one lock acquisition each; counts may
            // only differ by batches committed between the two scans.
            let changes = backend.scan_prefix("changes", b"").unwrap().len();
            let records = backend.scan_prefix("records", b"").unwrap().len();
            assert!(records >= changes);
        }
        writer.join().unwrap();
        assert_eq!(backend.len(), 400);
    }

    #[test]
    fn memory_clear() {
        let backend = InMemoryBackend::new();
        backend.put("ns", b"a", vec![1]).unwrap();
        backend.clear();
        assert!(backend.is_empty());
    }

    proptest! {
        #[test]
        fn scan_returns_exactly_prefixed_keys(
            keys in prop::collection::btree_set(prop::collection::vec(0u8..4, 0..4), 0..32),
            prefix in prop::collection::vec(0u8..4, 0..2),
        ) {
            let backend = InMemoryBackend::new();
            for key in &keys {
                backend.put("ns", key, key.clone()).unwrap();
            }
            let expected: Vec<Vec<u8>> = keys
                .iter()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            let found: Vec<Vec<u8>> = backend
                .scan_prefix("ns", &prefix)
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            prop_assert_eq!(found, expected);
        }
    }
}
