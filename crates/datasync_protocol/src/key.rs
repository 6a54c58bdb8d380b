//! Record identity and change state.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Global identifier of one record: a type namespace plus an id.
///
/// The byte encoding used as a storage key is
/// `| type_len: u32 BE | type_name | id (UTF-8) |`, so all keys of one
/// type share the prefix returned by [`ObjectKey::type_prefix`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Type namespace.
    #[serde(with = "serde_bytes")]
    pub type_name: Vec<u8>,
    /// Record id within the type.
    pub id: String,
}

impl ObjectKey {
    /// Creates a new key.
    pub fn new(type_name: impl Into<Vec<u8>>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Returns the storage prefix shared by every key of `type_name`.
    pub fn type_prefix(type_name: &[u8]) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + type_name.len());
        prefix.extend_from_slice(&(type_name.len() as u32).to_be_bytes());
        prefix.extend_from_slice(type_name);
        prefix
    }

    /// Encodes the key for use as a storage key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Self::type_prefix(&self.type_name);
        bytes.extend_from_slice(self.id.as_bytes());
        bytes
    }

    /// Decodes a key produced by [`ObjectKey::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidKey`] if the bytes are truncated or
    /// the id is not UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < 4 {
            return Err(ProtocolError::InvalidKey("missing type length".into()));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[..4]);
        let type_len = u32::from_be_bytes(len) as usize;
        let rest = &bytes[4..];
        if rest.len() < type_len {
            return Err(ProtocolError::InvalidKey(format!(
                "type length {type_len} exceeds key length {}",
                rest.len()
            )));
        }
        let (type_name, id) = rest.split_at(type_len);
        let id = std::str::from_utf8(id)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?
            .to_string();
        Ok(Self {
            type_name: type_name.to_vec(),
            id,
        })
    }

    /// Returns the type name as text, replacing invalid UTF-8.
    pub fn type_name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.type_name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name_lossy(), self.id)
    }
}

/// Pending-sync state of one record.
///
/// `Unchanged` is never stored: absence from the change log means
/// nothing is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChangeState {
    /// In sync with the server.
    Unchanged = 0,
    /// Locally written, not yet acknowledged.
    Changed = 1,
    /// Locally removed, not yet acknowledged.
    Deleted = 2,
}

impl ChangeState {
    /// Converts to the stored integer code.
    pub fn to_code(self) -> u8 {
        self as u8
    }

    /// Converts from a stored integer code. Only `0..=2` are valid.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeState::Unchanged),
            1 => Some(ChangeState::Changed),
            2 => Some(ChangeState::Deleted),
            _ => None,
        }
    }

    /// Returns true for `Changed` and `Deleted`.
    pub fn is_pending(self) -> bool {
        self != ChangeState::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_display() {
        let key = ObjectKey::new("Todo", "1");
        assert_eq!(key.to_string(), "Todo:1");
    }

    #[test]
    fn type_prefix_does_not_match_longer_type() {
        let short = ObjectKey::new("Todo", "x").to_bytes();
        let long = ObjectKey::new("TodoList", "x").to_bytes();
        let prefix = ObjectKey::type_prefix(b"Todo");
        assert!(short.starts_with(&prefix));
        assert!(!long.starts_with(&prefix));
    }

    #[test]
    fn truncated_key_is_rejected() {
        assert!(ObjectKey::from_bytes(&[0, 0]).is_err());
        assert!(ObjectKey::from_bytes(&[0, 0, 0, 9, b'a']).is_err());
    }

    #[test]
    fn change_state_codes() {
        for state in [ChangeState::Unchanged, ChangeState::Changed, ChangeState::Deleted] {
            assert_eq!(ChangeState::from_code(state.to_code()), Some(state));
        }
        assert_eq!(ChangeState::from_code(3), None);
        assert!(!ChangeState::Unchanged.is_pending());
        assert!(ChangeState::Deleted.is_pending());
    }

    proptest! {
        #[test]
        fn key_bytes_decode_to_same_key(
            type_name in prop::collection::vec(any::<u8>(), 0..16),
            id in "\\PC{0,16}",
        ) {
            let key = ObjectKey::new(type_name.clone(), id);
            let decoded = ObjectKey::from_bytes(&key.to_bytes()).unwrap();
            prop_assert!(key.to_bytes().starts_with(&ObjectKey::type_prefix(&type_name)));
            prop_assert_eq!(decoded, key);
        }
    }
}
