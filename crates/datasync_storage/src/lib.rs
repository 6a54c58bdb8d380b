//! # Datasync Storage
//!
//! Key-value storage substrate for datasync.
//!
//! Every durable table in the system (records, change log, key store,
//! server device table, data index, outboxes) is a namespace inside a
//! [`KeyValueBackend`]. Backends know nothing about what they store.
//!
//! ## Design Principles
//!
//! - Values are opaque bytes addressed by `(namespace, key)`
//! - A [`WriteBatch`] is applied atomically: readers see all of it or none of it
//! - Prefix scans return a consistent snapshot
//! - Backends are `Send + Sync` and use interior locking
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - Append-only, checksummed batch log on disk
//!
//! ## Example
//!
//! ```rust
//! use datasync_storage::{InMemoryBackend, KeyValueBackend, WriteBatch};
//!
//! let backend = InMemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.put("records", b"todo/1".to_vec(), b"buy milk".to_vec());
//! batch.put("changes", b"todo/1".to_vec(), vec![1]);
//! backend.write(batch).unwrap();
//!
//! assert_eq!(backend.get("records", b"todo/1").unwrap(), Some(b"buy milk".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod error;
mod file;
mod memory;

pub use backend::KeyValueBackend;
pub use batch::{WriteBatch, WriteOp};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
