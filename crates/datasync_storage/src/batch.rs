//! Atomic write batches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Composite key of the in-memory table shared by all backends.
pub(crate) type TableKey = (String, Vec<u8>);

/// In-memory table image shared by all backends.
pub(crate) type Table = BTreeMap<TableKey, Vec<u8>>;

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert or replace a value.
    Put {
        /// Target namespace.
        namespace: String,
        /// Key within the namespace.
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        /// New value.
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    /// Remove a value if present.
    Delete {
        /// Target namespace.
        namespace: String,
        /// Key within the namespace.
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

/// An ordered group of writes applied atomically.
///
/// Later operations on the same key win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert or replace.
    pub fn put(&mut self, namespace: impl Into<String>, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            namespace: namespace.into(),
            key,
            value,
        });
    }

    /// Queues a delete.
    pub fn delete(&mut self, namespace: impl Into<String>, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete {
            namespace: namespace.into(),
            key,
        });
    }

    /// Appends all operations of `other` after the ones already queued.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Returns the queued operations in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn apply_to(&self, table: &mut Table) {
        for op in &self.ops {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    table.insert((namespace.clone(), key.clone()), value.clone());
                }
                WriteOp::Delete { namespace, key } => {
                    table.remove(&(namespace.clone(), key.clone()));
                }
            }
        }
    }
}

pub(crate) fn get_from(table: &Table, namespace: &str, key: &[u8]) -> Option<Vec<u8>> {
    table.get(&(namespace.to_string(), key.to_vec())).cloned()
}

pub(crate) fn scan_from(table: &Table, namespace: &str, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    table
        .range((namespace.to_string(), prefix.to_vec())..)
        .take_while(|((ns, key), _)| ns == namespace && key.starts_with(prefix))
        .map(|((_, key), value)| (key.clone(), value.clone()))
        .collect()
}
