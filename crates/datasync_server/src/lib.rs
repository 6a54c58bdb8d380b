//! # Datasync Server
//!
//! Relay server for datasync devices.
//!
//! This crate provides:
//! - Device registration by signed nonce challenge
//! - Accounts grouping the devices that share data
//! - A per-account index of the newest version of every key
//! - Per-device outboxes holding changes until the device acknowledges them
//! - Live relay of changes to connected devices
//!
//! # Architecture
//!
//! The server never sees plaintext. Each uploaded change carries one
//! encrypted payload per device of the account; the server stores and
//! forwards the signed frame unchanged, so recipients verify the sender
//! themselves.
//!
//! State lives in a [`datasync_storage::KeyValueBackend`] managed by the
//! [`DatabaseController`]. Each connection is a session that reads frames
//! and processes them on tasks bounded by a server-wide worker limit.
//!
//! # Protocol
//!
//! 1. Server sends `Identify` with a nonce
//! 2. Device answers `Register` with its keys and the signed nonce
//! 3. Server answers `Account`, `DeviceList`, `Ready` and queued `Download`s
//! 4. Device uploads `Change`s, answered by `UploadAck` or `Conflict`
//! 5. Device acknowledges every `Download` with `DownloadAck`
//!
//! ## Key Invariants
//!
//! - Changes of one account are indexed and relayed in a single order
//! - An upload older than the indexed version is never relayed
//! - A queued change is removed only when its device acknowledges it

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod database;
mod error;
mod hub;
mod server;
mod session;

pub use config::ServerConfig;
pub use datasync_protocol::PROTOCOL_VERSION;
pub use database::{
    DatabaseController, DeviceRow, IndexEntry, IndexOutcome, OutboxEntry, SCHEMA_VERSION,
};
pub use error::{ServerError, ServerResult};
pub use hub::SessionHub;
pub use server::SyncServer;
