//! # Datasync Engine
//!
//! Client side of datasync: local change tracking, conflict resolution and
//! the exchange with the relay server.
//!
//! This crate provides:
//! - [`LocalStore`] and [`ChangeLog`]: versioned records and their pending state
//! - [`ConflictResolver`]: deterministic merging of divergent versions
//! - [`ChangeController`]: turns pending changes into uploads and applies downloads
//! - The remote connector: one authenticated, reconnecting server connection
//! - The exchange engine: the [`SyncState`] machine tying both together
//! - [`Setup`], [`SyncManager`] and [`DataStore`]: the application API
//!
//! ## Flow
//!
//! ```text
//! DataStore::save ─> LocalStore (Changed) ─> ChangeController ─> connector ─> server
//! server ─> connector (verify, decrypt) ─> ChangeController ─> LocalStore (Unchanged)
//! ```
//!
//! ## Key Invariants
//!
//! - Applying a download never marks a key as locally changed
//! - A change-log entry is cleared only by the acknowledgement of its exact version
//! - Unacknowledged uploads are retried on the next connection, never dropped
//! - Unrecoverable local state aborts the process after the fatal handler runs

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_controller;
mod change_log;
mod config;
mod data_store;
mod engine;
mod error;
mod keystore;
mod local_store;
mod remote_connector;
mod resolver;
mod setup;
mod state;

pub use change_controller::{ChangeController, DownloadOutcome};
pub use change_log::{ChangeEntry, ChangeLog, CHANGES_NAMESPACE};
pub use config::{RetryConfig, SyncConfig};
pub use data_store::{DataStore, SyncObject};
pub use engine::{FatalContext, FatalHandler};
pub use error::{SyncError, SyncResult};
pub use keystore::{DeviceRecord, Keystore, KEYSTORE_NAMESPACE};
pub use local_store::{LocalStore, RecordEntry, StoreTxn, TypeSummary, RECORDS_NAMESPACE};
pub use resolver::{resolve_conflict, ConflictResolver, VersionResolver};
pub use setup::{Setup, SyncManager};
pub use state::{EngineAction, RemoteEvent, SyncState, SyncStateMachine};
