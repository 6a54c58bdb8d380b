//! # Datasync Protocol
//!
//! Data model, wire messages and frame codec for datasync.
//!
//! This crate provides:
//! - [`ObjectKey`], [`ChangeState`], [`StoredRecord`] and [`ChangeOperation`]
//! - Wire messages exchanged between devices and the relay server
//! - The [`Frame`] envelope (message type, CBOR payload, signature)
//! - Length-prefixed async frame I/O over any tokio stream
//!
//! ## Handshake
//!
//! ```text
//! server -> Identify { nonce, sign scheme }
//! client -> Register { keys, signature(nonce) }
//! server -> Account { device id } , DeviceList , Ready { pending }
//! ```
//!
//! After `Ready`, the client uploads signed `Change` frames and receives
//! the other devices' changes as `Download` frames.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod codec;
mod error;
mod frame;
mod key;
mod messages;
mod record;

pub use cbor::{from_cbor, to_cbor};
pub use codec::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Frame, WireMessage};
pub use key::{ChangeState, ObjectKey};
pub use messages::{
    Account, ChangeMessage, Conflict, DeviceInfo, DeviceList, Download, DownloadAck, Identify,
    KeyScheme, Ready, RecipientPayload, Register, UploadAck, NONCE_SIZE, PROTOCOL_VERSION,
};
pub use record::{checksum, ChangeKind, ChangeOperation, Checksum, StoredRecord};
