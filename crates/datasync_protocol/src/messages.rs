//! Protocol messages.

use crate::frame::{Frame, WireMessage};
use crate::key::ObjectKey;
use crate::record::{ChangeKind, Checksum};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the registration challenge in bytes.
pub const NONCE_SIZE: usize = 32;

/// A pluggable algorithm identifier plus an optional parameter
/// (curve name, key size, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyScheme {
    /// Algorithm identifier.
    pub algorithm: String,
    /// Algorithm parameter, if the algorithm takes one.
    pub param: Option<String>,
}

impl KeyScheme {
    /// Creates a scheme.
    pub fn new(algorithm: impl Into<String>, param: Option<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            param,
        }
    }
}

/// Server challenge sent as soon as a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    /// Random challenge the client must sign.
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Signature scheme the server expects.
    pub sign_scheme: KeyScheme,
    /// Server protocol version.
    pub protocol_version: u16,
}

impl WireMessage for Identify {
    const TYPE_NAME: &'static str = "Identify";
}

/// Device registration, answering an [`Identify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    /// Human-readable device name.
    pub device_name: String,
    /// Account to join, or `None` to create one.
    pub account: Option<Uuid>,
    /// Signature scheme of `sign_key`.
    pub sign_scheme: KeyScheme,
    /// Public signing key.
    #[serde(with = "serde_bytes")]
    pub sign_key: Vec<u8>,
    /// Encryption scheme of `crypt_key`.
    pub crypt_scheme: KeyScheme,
    /// Public encryption key.
    #[serde(with = "serde_bytes")]
    pub crypt_key: Vec<u8>,
    /// The nonce from `Identify`.
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Signature over `nonce` with the private signing key.
    #[serde(with = "serde_bytes")]
    pub nonce_signature: Vec<u8>,
}

impl WireMessage for Register {
    const TYPE_NAME: &'static str = "Register";
}

/// Registration result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Id issued to the device.
    pub device_id: Uuid,
    /// Account the device belongs to.
    pub account_id: Uuid,
}

impl WireMessage for Account {
    const TYPE_NAME: &'static str = "Account";
}

/// Public identity of one device of the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id.
    pub device_id: Uuid,
    /// Device name.
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

/// All devices of the account, sent after registration and whenever a
/// device joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    /// Devices including the receiver.
    pub devices: Vec<DeviceInfo>,
}

impl WireMessage for DeviceList {
    const TYPE_NAME: &'static str = "DeviceList";
}

/// Registration is complete; `pending` queued downloads follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    /// Number of `Download` frames queued for this device.
    pub pending: u64,
}

impl WireMessage for Ready {
    const TYPE_NAME: &'static str = "Ready";
}

/// A value encrypted for one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientPayload {
    /// Recipient device.
    pub device_id: Uuid,
    /// Sealed value.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// A signed change uploaded by a device and relayed verbatim to the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Uploading device.
    pub sender: Uuid,
    /// Record identity.
    pub key: ObjectKey,
    /// `Upload` or `Remove`.
    pub kind: ChangeKind,
    /// Record version.
    pub version: u64,
    /// Checksum of the plain value, absent for removals.
    pub checksum: Option<Checksum>,
    /// The value sealed for each device of the account.
    pub payloads: Vec<RecipientPayload>,
}

impl ChangeMessage {
    /// Returns the ciphertext addressed to `device_id`.
    pub fn payload_for(&self, device_id: Uuid) -> Option<&[u8]> {
        self.payloads
            .iter()
            .find(|p| p.device_id == device_id)
            .map(|p| p.ciphertext.as_slice())
    }
}

impl WireMessage for ChangeMessage {
    const TYPE_NAME: &'static str = "Change";
}

/// A relayed change. `frame` is the sender's signed `Change` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    /// Original signed frame.
    pub frame: Frame,
}

impl WireMessage for Download {
    const TYPE_NAME: &'static str = "Download";
}

/// The server accepted an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    /// Record identity.
    pub key: ObjectKey,
    /// Accepted version.
    pub version: u64,
}

impl WireMessage for UploadAck {
    const TYPE_NAME: &'static str = "UploadAck";
}

/// The server rejected an upload because it holds a newer version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Record identity.
    pub key: ObjectKey,
    /// Rejected version.
    pub version: u64,
    /// Version the account last agreed on.
    pub server_version: u64,
    /// Signed `Change` frame of the accepted version, if still retained.
    pub current: Option<Frame>,
}

impl WireMessage for Conflict {
    const TYPE_NAME: &'static str = "Conflict";
}

/// A device applied a download and no longer needs it queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAck {
    /// Record identity.
    pub key: ObjectKey,
    /// Applied version.
    pub version: u64,
}

impl WireMessage for DownloadAck {
    const TYPE_NAME: &'static str = "DownloadAck";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::checksum;

    #[test]
    fn payload_lookup_by_device() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let msg = ChangeMessage {
            sender: a,
            key: ObjectKey::new("Todo", "1"),
            kind: ChangeKind::Upload,
            version: 1,
            checksum: Some(checksum(b"x")),
            payloads: vec![
                RecipientPayload {
                    device_id: a,
                    ciphertext: vec![1],
                },
                RecipientPayload {
                    device_id: b,
                    ciphertext: vec![2],
                },
            ],
        };
        assert_eq!(msg.payload_for(b), Some(&[2u8][..]));
        assert_eq!(msg.payload_for(Uuid::new_v4()), None);
    }

    #[test]
    fn download_carries_signed_frame_intact() {
        let change = ChangeMessage {
            sender: Uuid::new_v4(),
            key: ObjectKey::new("Todo", "1"),
            kind: ChangeKind::Remove,
            version: 9,
            checksum: None,
            payloads: Vec::new(),
        };
        let inner = Frame::new(&change).unwrap().with_signature(vec![7; 64]);
        let outer = Frame::new(&Download {
            frame: inner.clone(),
        })
        .unwrap();

        let relayed = outer.decode::<Download>().unwrap().frame;
        assert_eq!(relayed, inner);
        assert_eq!(relayed.decode::<ChangeMessage>().unwrap(), change);
    }
}
