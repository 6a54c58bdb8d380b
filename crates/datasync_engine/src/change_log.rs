//! Durable set of records pending synchronization.
//!
//! Rows live in the `changes` namespace keyed by [`ObjectKey::to_bytes`]
//! and hold a single state byte (`1` = changed, `2` = deleted). A missing
//! row means `Unchanged`; marking a key `Unchanged` deletes its row.

use crate::error::{SyncError, SyncResult};
use datasync_protocol::{ChangeState, ObjectKey};
use datasync_storage::{KeyValueBackend, WriteBatch};
use std::sync::Arc;

/// Namespace holding change-log rows.
pub const CHANGES_NAMESPACE: &str = "changes";

/// One pending change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Record identity.
    pub key: ObjectKey,
    /// `Changed` or `Deleted`.
    pub state: ChangeState,
}

/// Durable mapping `ObjectKey -> ChangeState`.
#[derive(Clone)]
pub struct ChangeLog {
    backend: Arc<dyn KeyValueBackend>,
}

impl ChangeLog {
    /// Creates a change log over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Returns the state of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CorruptState`] if the stored byte is not a valid state.
    pub fn state(&self, key: &ObjectKey) -> SyncResult<ChangeState> {
        match self.backend.get(CHANGES_NAMESPACE, &key.to_bytes())? {
            Some(bytes) => decode_state(&bytes),
            None => Ok(ChangeState::Unchanged),
        }
    }

    /// Sets the state of `key`. `Unchanged` deletes the row.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub fn mark_local_changed(&self, key: &ObjectKey, state: ChangeState) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        Self::stage(&mut batch, key, state);
        self.backend.write(batch)?;
        Ok(())
    }

    /// Sets every existing row of `type_name` to `state`, returning how many
    /// rows were touched. `Unchanged` deletes them.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read or write fails.
    pub fn mark_all_local_changed(&self, type_name: &[u8], state: ChangeState) -> SyncResult<usize> {
        let rows = self
            .backend
            .scan_prefix(CHANGES_NAMESPACE, &ObjectKey::type_prefix(type_name))?;
        let mut batch = WriteBatch::new();
        for (key, _) in &rows {
            match state {
                ChangeState::Unchanged => batch.delete(CHANGES_NAMESPACE, key.clone()),
                pending => batch.put(CHANGES_NAMESPACE, key.clone(), vec![pending.to_code()]),
            }
        }
        self.backend.write(batch)?;
        Ok(rows.len())
    }

    /// Returns a consistent snapshot of all pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CorruptState`] for undecodable rows.
    pub fn list_local_changes(&self) -> SyncResult<Vec<ChangeEntry>> {
        let rows = self.backend.scan_prefix(CHANGES_NAMESPACE, &[])?;
        let mut entries = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let state = decode_state(&value)?;
            if !state.is_pending() {
                continue;
            }
            let key = ObjectKey::from_bytes(&key)
                .map_err(|e| SyncError::CorruptState(format!("change log key: {e}")))?;
            entries.push(ChangeEntry { key, state });
        }
        Ok(entries)
    }

    /// Returns the number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.list_local_changes()?.len())
    }

    /// Queues a state change into a batch shared with a record write.
    pub(crate) fn stage(batch: &mut WriteBatch, key: &ObjectKey, state: ChangeState) {
        match state {
            ChangeState::Unchanged => batch.delete(CHANGES_NAMESPACE, key.to_bytes()),
            pending => batch.put(CHANGES_NAMESPACE, key.to_bytes(), vec![pending.to_code()]),
        }
    }
}

fn decode_state(bytes: &[u8]) -> SyncResult<ChangeState> {
    match bytes {
        [code] => ChangeState::from_code(*code)
            .ok_or_else(|| SyncError::CorruptState(format!("change state {code} out of range"))),
        _ => Err(SyncError::CorruptState(format!(
            "change state row of {} bytes",
            bytes.len()
        ))),
    }
}
