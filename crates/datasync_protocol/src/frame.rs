//! The wire envelope.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A message that can travel inside a [`Frame`].
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Type name written into the frame header.
    const TYPE_NAME: &'static str;
}

/// One unit on the wire: a typed CBOR payload and an optional signature.
///
/// The signature, when present, covers [`Frame::signed_bytes`]; binding
/// the type name prevents a signed payload from being replayed as a
/// different message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Type name of the payload.
    pub message_type: String,
    /// CBOR-encoded message.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Sender signature over `signed_bytes()`, empty if unsigned.
    #[serde(with = "serde_bytes", default)]
    pub signature: Vec<u8>,
}

impl Frame {
    /// Wraps a message in an unsigned frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn new<M: WireMessage>(message: &M) -> ProtocolResult<Self> {
        Ok(Self {
            message_type: M::TYPE_NAME.to_string(),
            payload: to_cbor(message)?,
            signature: Vec::new(),
        })
    }

    /// Attaches a signature.
    #[must_use]
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Returns true if the frame carries a message of type `M`.
    pub fn is<M: WireMessage>(&self) -> bool {
        self.message_type == M::TYPE_NAME
    }

    /// Returns true if a signature is attached.
    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Decodes the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedMessage`] if the frame holds a
    /// different type, or a codec error if the payload is malformed.
    pub fn decode<M: WireMessage>(&self) -> ProtocolResult<M> {
        if !self.is::<M>() {
            return Err(ProtocolError::UnexpectedMessage {
                expected: M::TYPE_NAME,
                actual: self.message_type.clone(),
            });
        }
        from_cbor(&self.payload)
    }

    /// Returns the bytes covered by the signature: `type ‖ 0x00 ‖ payload`.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.message_type.len() + 1 + self.payload.len());
        bytes.extend_from_slice(self.message_type.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Encodes the whole frame as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a frame produced by [`Frame::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Ready, UploadAck};
    use crate::key::ObjectKey;

    #[test]
    fn decode_checks_type() {
        let frame = Frame::new(&Ready { pending: 3 }).unwrap();
        assert!(frame.is::<Ready>());
        assert!(!frame.is_signed());
        assert_eq!(frame.decode::<Ready>().unwrap().pending, 3);

        let err = frame.decode::<UploadAck>().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedMessage { expected: "UploadAck", .. }
        ));
    }

    #[test]
    fn signed_bytes_bind_type_name() {
        let ack = UploadAck {
            key: ObjectKey::new("Todo", "1"),
            version: 2,
        };
        let mut frame = Frame::new(&ack).unwrap();
        let original = frame.signed_bytes();
        frame.message_type = "DownloadAck".into();
        assert_ne!(frame.signed_bytes(), original);
    }

    #[test]
    fn unsigned_frame_decodes_without_signature_field() {
        #[derive(Serialize)]
        struct Legacy<'a> {
            message_type: &'a str,
            #[serde(with = "serde_bytes")]
            payload: &'a [u8],
        }
        let payload = to_cbor(&Ready { pending: 0 }).unwrap();
        let bytes = to_cbor(&Legacy {
            message_type: "Ready",
            payload: &payload,
        })
        .unwrap();
        let frame = Frame::from_bytes(&bytes).unwrap();
        assert!(frame.signature.is_empty());
        assert_eq!(frame.decode::<Ready>().unwrap().pending, 0);
    }
}
