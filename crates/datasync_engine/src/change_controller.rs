//! Moves changes between the local store and the remote connector.

use crate::error::{SyncError, SyncResult};
use crate::local_store::{LocalStore, RecordEntry, StoreTxn};
use crate::remote_connector::ConnectorCommand;
use crate::resolver::{resolve_conflict, ConflictResolver};
use datasync_protocol::{ChangeOperation, ChangeState, ObjectKey, StoredRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What happened to an inbound change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Written to the local store as received.
    Applied,
    /// Older than or equal to local state; nothing written.
    Ignored,
    /// Merged with a pending local change; the result must be re-uploaded.
    Resolved,
}

/// Drains the change log into upload operations and applies downloads.
///
/// The controller is owned by the engine task; it is never shared.
pub struct ChangeController {
    store: Arc<LocalStore>,
    resolver: Arc<dyn ConflictResolver>,
    outbound: mpsc::UnboundedSender<ConnectorCommand>,
    in_flight: HashMap<ObjectKey, u64>,
    upload_enabled: bool,
}

impl ChangeController {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        resolver: Arc<dyn ConflictResolver>,
        outbound: mpsc::UnboundedSender<ConnectorCommand>,
    ) -> Self {
        Self {
            store,
            resolver,
            outbound,
            in_flight: HashMap::new(),
            upload_enabled: false,
        }
    }

    /// Returns true while any upload awaits acknowledgement.
    pub fn is_uploading(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Returns true if pending changes are emitted as they appear.
    pub fn is_upload_enabled(&self) -> bool {
        self.upload_enabled
    }

    /// Number of unacknowledged uploads.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Turns emission on (draining immediately) or off. Pending entries are
    /// kept either way.
    ///
    /// # Errors
    ///
    /// Returns an error if draining fails.
    pub fn set_uploading_enabled(&mut self, enabled: bool) -> SyncResult<()> {
        self.upload_enabled = enabled;
        if enabled {
            self.drain()?;
        }
        Ok(())
    }

    /// Emits one upload per pending change-log entry not already in flight
    /// at its current version. Returns the number emitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the connector is gone.
    pub fn drain(&mut self) -> SyncResult<usize> {
        if !self.upload_enabled {
            return Ok(0);
        }

        let mut sent = 0;
        for change in self.store.change_log().list_local_changes()? {
            let Some(entry) = self.store.entry(&change.key)? else {
                // Recheck under the write lock; a save may have just landed.
                let cleared = self.store.transaction(|txn| {
                    if txn.entry(&change.key)?.is_some() {
                        return Ok(false);
                    }
                    txn.set_change_state(&change.key, ChangeState::Unchanged);
                    Ok(true)
                })?;
                if cleared {
                    warn!(key = %change.key, "change log entry without record, cleared");
                }
                continue;
            };
            if self.in_flight.get(&change.key) == Some(&entry.version) {
                continue;
            }

            let op = match entry.to_record() {
                Some(record) => ChangeOperation::upload(record),
                None => ChangeOperation::remove(change.key.clone(), entry.version),
            };
            self.in_flight.insert(change.key, entry.version);
            self.outbound
                .send(ConnectorCommand::Upload(op))
                .map_err(|_| SyncError::ShutDown)?;
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, in_flight = self.in_flight.len(), "uploads emitted");
        }
        Ok(sent)
    }

    /// Handles the server's acknowledgement of an upload.
    ///
    /// The change-log entry is cleared only if the record still has the
    /// acknowledged version; a newer local write stays pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    pub fn upload_done(&mut self, key: &ObjectKey, version: u64) -> SyncResult<()> {
        if self.in_flight.get(key) == Some(&version) {
            self.in_flight.remove(key);
        }
        self.store.transaction(|txn| {
            if let Some(entry) = txn.entry(key)? {
                if entry.version == version && txn.change_state(key)?.is_pending() {
                    txn.set_change_state(key, ChangeState::Unchanged);
                }
            }
            Ok(())
        })
    }

    /// Forgets all unacknowledged uploads. Their change-log entries stay,
    /// so they are sent again on the next drain.
    pub fn clear_uploads(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(dropped = self.in_flight.len(), "in-flight uploads cleared");
        }
        self.in_flight.clear();
    }

    /// Applies an inbound change and acknowledges it to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated or the connector is gone.
    pub fn apply_download(&mut self, op: ChangeOperation) -> SyncResult<DownloadOutcome> {
        let key = op.key.clone();
        let version = op.version;
        let outcome = self.apply_inbound(op)?;
        self.outbound
            .send(ConnectorCommand::AckDownload { key, version })
            .map_err(|_| SyncError::ShutDown)?;
        Ok(outcome)
    }

    /// Handles the server's rejection of an upload.
    ///
    /// `current` is the version the server holds; it is merged like a
    /// download, and any remaining local change is lifted above
    /// `server_version` so the next upload is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated or the connector is gone.
    pub fn handle_conflict(
        &mut self,
        key: &ObjectKey,
        rejected_version: u64,
        server_version: u64,
        current: Option<ChangeOperation>,
    ) -> SyncResult<()> {
        if self.in_flight.get(key) == Some(&rejected_version) {
            self.in_flight.remove(key);
        }
        if let Some(current) = current {
            self.apply_inbound(current)?;
        }

        self.store.transaction(|txn| {
            let state = txn.change_state(key)?;
            match txn.entry(key)? {
                Some(entry) if state.is_pending() && entry.version <= server_version => {
                    stage_entry(txn, &entry, server_version + 1)?;
                    debug!(%key, from = entry.version, to = server_version + 1, "pending change lifted");
                }
                _ => {}
            }
            Ok(())
        })?;
        self.drain()?;
        Ok(())
    }

    fn apply_inbound(&mut self, op: ChangeOperation) -> SyncResult<DownloadOutcome> {
        let resolver = Arc::clone(&self.resolver);
        let outcome = self.store.transaction(|txn| {
            let key = op.key.clone();
            let local = txn.entry(&key)?;
            let state = txn.change_state(&key)?;

            let local = match local {
                Some(local) if state.is_pending() => local,
                Some(local) if local.version >= op.version => return Ok(DownloadOutcome::Ignored),
                _ => {
                    stage_remote(txn, &op)?;
                    txn.set_change_state(&key, ChangeState::Unchanged);
                    return Ok(DownloadOutcome::Applied);
                }
            };

            let merged = local.version.max(op.version).saturating_add(1);
            match (local.to_record(), op.value.as_ref()) {
                (Some(mine), Some(theirs)) => {
                    let theirs = StoredRecord::new(key.clone(), theirs.clone(), op.version);
                    if mine.version == theirs.version && mine.checksum == theirs.checksum {
                        // The server already holds exactly this version.
                        txn.set_change_state(&key, ChangeState::Unchanged);
                        return Ok(DownloadOutcome::Applied);
                    }
                    let resolved = resolve_conflict(resolver.as_ref(), &mine, &theirs);
                    txn.write_record(&resolved)?;
                    txn.set_change_state(&key, ChangeState::Changed);
                    Ok(DownloadOutcome::Resolved)
                }
                (None, None) if op.version > local.version => {
                    txn.write_tombstone(&key, op.version)?;
                    txn.set_change_state(&key, ChangeState::Unchanged);
                    Ok(DownloadOutcome::Applied)
                }
                (None, None) => {
                    txn.write_tombstone(&key, merged)?;
                    txn.set_change_state(&key, ChangeState::Deleted);
                    Ok(DownloadOutcome::Resolved)
                }
                // Update against removal: a strictly newer remote state is
                // adopted, otherwise the update wins.
                (_, _) if op.version > local.version => {
                    stage_remote(txn, &op)?;
                    txn.set_change_state(&key, ChangeState::Unchanged);
                    Ok(DownloadOutcome::Applied)
                }
                (Some(mine), None) => {
                    txn.write_record(&mine.with_version(merged))?;
                    txn.set_change_state(&key, ChangeState::Changed);
                    Ok(DownloadOutcome::Resolved)
                }
                (None, Some(theirs)) => {
                    txn.write_record(&StoredRecord::new(key.clone(), theirs.clone(), merged))?;
                    txn.set_change_state(&key, ChangeState::Changed);
                    Ok(DownloadOutcome::Resolved)
                }
            }
        })?;

        if outcome == DownloadOutcome::Resolved {
            debug!("download merged with pending local change");
        }
        Ok(outcome)
    }
}

fn stage_remote(txn: &mut StoreTxn<'_>, op: &ChangeOperation) -> SyncResult<()> {
    match &op.value {
        Some(value) => txn.write_record(&StoredRecord::new(op.key.clone(), value.clone(), op.version)),
        None => txn.write_tombstone(&op.key, op.version),
    }
}

fn stage_entry(txn: &mut StoreTxn<'_>, entry: &RecordEntry, version: u64) -> SyncResult<()> {
    match entry.to_record() {
        Some(record) => txn.write_record(&record.with_version(version)),
        None => txn.write_tombstone(&entry.key, version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::RECORDS_NAMESPACE;
    use crate::resolver::VersionResolver;
    use datasync_storage::{InMemoryBackend, KeyValueBackend, StorageResult, WriteBatch};
    use parking_lot::Mutex;

    struct Harness {
        store: Arc<LocalStore>,
        controller: ChangeController,
        commands: mpsc::UnboundedReceiver<ConnectorCommand>,
    }

    fn harness() -> Harness {
        let store = Arc::new(LocalStore::new(Arc::new(InMemoryBackend::new())));
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = ChangeController::new(Arc::clone(&store), Arc::new(VersionResolver), tx);
        Harness {
            store,
            controller,
            commands: rx,
        }
    }

    fn todo(id: &str) -> ObjectKey {
        ObjectKey::new("Todo", id)
    }

    fn uploads(rx: &mut mpsc::UnboundedReceiver<ConnectorCommand>) -> Vec<ChangeOperation> {
        let mut ops = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let ConnectorCommand::Upload(op) = cmd {
                ops.push(op);
            }
        }
        ops
    }

    #[test]
    fn disabled_controller_emits_nothing() {
        let mut h = harness();
        h.store.save(&todo("1"), b"a".to_vec()).unwrap();
        assert_eq!(h.controller.drain().unwrap(), 0);
        assert!(uploads(&mut h.commands).is_empty());
        assert!(!h.controller.is_uploading());
    }

    #[test]
    fn enabling_drains_each_pending_entry_once() {
        let mut h = harness();
        h.store.save(&todo("1"), b"a".to_vec()).unwrap();
        h.store.save(&todo("2"), b"b".to_vec()).unwrap();
        h.store.remove(&todo("2")).unwrap();

        h.controller.set_uploading_enabled(true).unwrap();
        let ops = uploads(&mut h.commands);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().any(|op| op.kind == datasync_protocol::ChangeKind::Remove && op.version == 2));
        assert!(h.controller.is_uploading());

        // Already in flight at the same version.
        assert_eq!(h.controller.drain().unwrap(), 0);
    }

    #[test]
    fn ack_clears_only_matching_version() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"a".to_vec()).unwrap();
        h.controller.set_uploading_enabled(true).unwrap();
        uploads(&mut h.commands);

        // A second write lands while v1 is in flight.
        h.store.save(&key, b"b".to_vec()).unwrap();
        h.controller.drain().unwrap();
        assert_eq!(uploads(&mut h.commands)[0].version, 2);

        h.controller.upload_done(&key, 1).unwrap();
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Changed);
        assert!(h.controller.is_uploading());

        h.controller.upload_done(&key, 2).unwrap();
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
        assert!(!h.controller.is_uploading());
    }

    #[test]
    fn clear_uploads_keeps_change_log() {
        let mut h = harness();
        h.store.save(&todo("1"), b"a".to_vec()).unwrap();
        h.controller.set_uploading_enabled(true).unwrap();
        uploads(&mut h.commands);

        h.controller.clear_uploads();
        assert!(!h.controller.is_uploading());
        assert_eq!(h.store.change_log().pending_count().unwrap(), 1);

        // Retried on the next drain.
        assert_eq!(h.controller.drain().unwrap(), 1);
    }

    #[test]
    fn orphan_change_row_is_cleared() {
        let mut h = harness();
        let key = todo("1");
        h.store.change_log().mark_local_changed(&key, ChangeState::Changed).unwrap();

        h.controller.set_uploading_enabled(true).unwrap();
        assert!(uploads(&mut h.commands).is_empty());
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// Runs a hook the first time a record is read.
    struct HookedBackend {
        inner: InMemoryBackend,
        on_record_read: Mutex<Option<Hook>>,
    }

    impl KeyValueBackend for HookedBackend {
        fn get(&self, namespace: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
            let value = self.inner.get(namespace, key)?;
            if namespace == RECORDS_NAMESPACE {
                let hook = self.on_record_read.lock().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            Ok(value)
        }

        fn scan_prefix(
            &self,
            namespace: &str,
            prefix: &[u8],
        ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(namespace, prefix)
        }

        fn write(&self, batch: WriteBatch) -> StorageResult<()> {
            self.inner.write(batch)
        }

        fn sync(&self) -> StorageResult<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn orphan_cleanup_keeps_a_racing_save() {
        let backend = Arc::new(HookedBackend {
            inner: InMemoryBackend::new(),
            on_record_read: Mutex::new(None),
        });
        let store = Arc::new(LocalStore::new(
            Arc::clone(&backend) as Arc<dyn KeyValueBackend>
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller =
            ChangeController::new(Arc::clone(&store), Arc::new(VersionResolver), tx);
        let key = todo("1");
        store.change_log().mark_local_changed(&key, ChangeState::Changed).unwrap();

        // The save lands after the controller saw no record.
        {
            let store = Arc::clone(&store);
            let key = key.clone();
            *backend.on_record_read.lock() = Some(Box::new(move || {
                store.save(&key, b"a".to_vec()).unwrap();
            }));
        }
        controller.set_uploading_enabled(true).unwrap();

        assert_eq!(store.change_log().state(&key).unwrap(), ChangeState::Changed);
        controller.drain().unwrap();
        assert_eq!(uploads(&mut rx).len(), 1);
    }

    #[test]
    fn pausing_keeps_entries_queued() {
        let mut h = harness();
        h.controller.set_uploading_enabled(false).unwrap();
        h.store.save(&todo("1"), b"a".to_vec()).unwrap();
        assert_eq!(h.controller.drain().unwrap(), 0);
        h.controller.set_uploading_enabled(true).unwrap();
        assert_eq!(uploads(&mut h.commands).len(), 1);
    }

    #[test]
    fn download_without_local_change_is_applied_and_acked() {
        let mut h = harness();
        let key = todo("1");
        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"buy milk".to_vec()), 1))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Applied);
        assert_eq!(h.store.load(&key).unwrap(), Some(b"buy milk".to_vec()));
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
        assert!(matches!(
            h.commands.try_recv().unwrap(),
            ConnectorCommand::AckDownload { version: 1, .. }
        ));
    }

    #[test]
    fn stale_download_is_ignored() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"a".to_vec()).unwrap();
        h.store.save(&key, b"b".to_vec()).unwrap();
        h.store.change_log().mark_local_changed(&key, ChangeState::Unchanged).unwrap();

        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"old".to_vec()), 1))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Ignored);
        assert_eq!(h.store.load(&key).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn remote_removal_without_local_change() {
        let mut h = harness();
        let key = todo("1");
        h.controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"a".to_vec()), 1))
            .unwrap();
        h.controller
            .apply_download(ChangeOperation::download(key.clone(), None, 2))
            .unwrap();
        assert_eq!(h.store.load(&key).unwrap(), None);
        assert_eq!(h.store.entry(&key).unwrap().unwrap().version, 2);
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
    }

    #[test]
    fn concurrent_edit_is_resolved_above_both_versions() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"mine".to_vec()).unwrap();

        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"theirs".to_vec()), 1))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Resolved);

        let record = h.store.record(&key).unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Changed);

        let expected = VersionResolver.resolve(
            &StoredRecord::new(key.clone(), b"mine".to_vec(), 1),
            &StoredRecord::new(key, b"theirs".to_vec(), 1),
        );
        assert_eq!(record.value, expected.value);
    }

    #[test]
    fn echo_of_own_version_clears_pending() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"mine".to_vec()).unwrap();
        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"mine".to_vec()), 1))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Applied);
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
    }

    #[test]
    fn update_beats_removal_on_equal_version() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"mine".to_vec()).unwrap();

        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), None, 1))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Resolved);
        let record = h.store.record(&key).unwrap().unwrap();
        assert_eq!(record.value, b"mine".to_vec());
        assert_eq!(record.version, 2);
    }

    #[test]
    fn newer_remote_update_beats_local_removal() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"a".to_vec()).unwrap();
        h.store.change_log().mark_local_changed(&key, ChangeState::Unchanged).unwrap();
        h.store.remove(&key).unwrap();

        let outcome = h
            .controller
            .apply_download(ChangeOperation::download(key.clone(), Some(b"theirs".to_vec()), 5))
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::Applied);
        assert_eq!(h.store.load(&key).unwrap(), Some(b"theirs".to_vec()));
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Unchanged);
    }

    #[test]
    fn conflict_lifts_pending_version_and_reuploads() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"mine".to_vec()).unwrap();
        h.controller.set_uploading_enabled(true).unwrap();
        uploads(&mut h.commands);

        let current = ChangeOperation::download(key.clone(), Some(b"theirs".to_vec()), 4);
        h.controller.handle_conflict(&key, 1, 4, Some(current)).unwrap();

        let record = h.store.record(&key).unwrap().unwrap();
        assert_eq!(record.version, 5);
        assert_eq!(h.store.change_log().state(&key).unwrap(), ChangeState::Changed);

        let resent = uploads(&mut h.commands);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].version, 5);
    }

    #[test]
    fn conflict_without_current_still_lifts() {
        let mut h = harness();
        let key = todo("1");
        h.store.save(&key, b"mine".to_vec()).unwrap();
        h.controller.handle_conflict(&key, 1, 3, None).unwrap();
        assert_eq!(h.store.record(&key).unwrap().unwrap().version, 4);
        assert_eq!(h.store.load(&key).unwrap(), Some(b"mine".to_vec()));
    }
}
