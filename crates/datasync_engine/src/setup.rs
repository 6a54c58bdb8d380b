//! Assembling and running a sync setup.

use crate::config::SyncConfig;
use crate::data_store::{DataStore, OpTracker};
use crate::engine::{self, EngineHandle, EngineParts, FatalContext, FatalHandler};
use crate::error::SyncResult;
use crate::keystore::{DeviceRecord, Keystore};
use crate::local_store::LocalStore;
use crate::resolver::{ConflictResolver, VersionResolver};
use crate::state::SyncState;
use datasync_crypto::CryptoRegistry;
use datasync_storage::{FileBackend, InMemoryBackend, KeyValueBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Builder for a [`SyncManager`].
///
/// Without a backend or storage path, records are kept in memory only.
pub struct Setup {
    config: SyncConfig,
    backend: Option<Arc<dyn KeyValueBackend>>,
    storage_path: Option<PathBuf>,
    resolver: Arc<dyn ConflictResolver>,
    registry: CryptoRegistry,
    fatal: Option<FatalHandler>,
}

impl Setup {
    /// Creates a setup with the default resolver and all algorithms enabled.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            backend: None,
            storage_path: None,
            resolver: Arc::new(VersionResolver),
            registry: CryptoRegistry::default(),
            fatal: None,
        }
    }

    /// Uses an existing backend.
    pub fn with_backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Stores records in a [`FileBackend`] at `path`.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Restricts or extends the enabled algorithms.
    pub fn with_registry(mut self, registry: CryptoRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the handler called before the process aborts on unrecoverable
    /// local state.
    pub fn with_fatal_handler(
        mut self,
        handler: impl Fn(&str, &FatalContext) + Send + Sync + 'static,
    ) -> Self {
        self.fatal = Some(Arc::new(handler));
        self
    }

    /// Opens storage, loads or creates the device identity and starts the
    /// engine on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be opened, a configured scheme
    /// is not enabled, or the stored identity is unreadable.
    pub async fn start(self) -> SyncResult<SyncManager> {
        let backend: Arc<dyn KeyValueBackend> = match (self.backend, &self.storage_path) {
            (Some(backend), _) => backend,
            (None, Some(path)) => Arc::new(FileBackend::open_with_create_dirs(path)?),
            (None, None) => Arc::new(InMemoryBackend::new()),
        };

        self.registry.sign_algorithm(&self.config.sign_scheme)?;
        self.registry.crypt_algorithm(&self.config.crypt_scheme)?;

        let keystore = Keystore::new(Arc::clone(&backend));
        let identity = Arc::new(keystore.load_or_create_identity(
            &self.registry,
            &self.config.sign_scheme,
            &self.config.crypt_scheme,
        )?);
        let store = Arc::new(LocalStore::new(backend));
        let setup_name = self.config.setup_name.clone();
        let fingerprint = identity.fingerprint();
        info!(
            setup = %setup_name,
            remote = %self.config.remote_addr,
            fingerprint = %fingerprint,
            pending = store.change_log().pending_count()?,
            "starting sync"
        );

        let engine = engine::spawn(EngineParts {
            config: self.config,
            store: Arc::clone(&store),
            resolver: self.resolver,
            registry: Arc::new(self.registry),
            identity,
            keystore: keystore.clone(),
            fatal: self.fatal,
        });
        let ops = Arc::new(OpTracker::default());

        Ok(SyncManager {
            setup_name,
            fingerprint,
            data_store: DataStore::new(Arc::clone(&store), engine.clone(), Arc::clone(&ops)),
            store,
            keystore,
            engine,
            ops,
        })
    }
}

/// A running sync setup.
pub struct SyncManager {
    setup_name: String,
    fingerprint: String,
    data_store: DataStore,
    store: Arc<LocalStore>,
    keystore: Keystore,
    engine: EngineHandle,
    ops: Arc<OpTracker>,
}

impl SyncManager {
    /// The application-facing store.
    pub fn data_store(&self) -> &DataStore {
        &self.data_store
    }

    /// The underlying record store.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Name of this setup.
    pub fn setup_name(&self) -> &str {
        &self.setup_name
    }

    /// Fingerprint of the device's signing key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Current synchronization state.
    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.engine.subscribe_state()
    }

    /// Text of the error behind the current `Error` state.
    pub fn last_error(&self) -> Option<String> {
        self.engine.last_error()
    }

    /// Ids issued by the server, once registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore cannot be read.
    pub fn device(&self) -> SyncResult<Option<DeviceRecord>> {
        self.keystore.device()
    }

    /// Returns true once [`SyncManager::finalize`] has completed.
    pub fn is_finalized(&self) -> bool {
        self.engine.is_finalized()
    }

    /// Waits for running store operations, then stops the engine.
    ///
    /// Idempotent; later data-store calls fail with `ShutDown`.
    pub async fn finalize(&self) {
        self.ops.close().await;
        self.engine.finalize().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::SyncObject;
    use crate::error::SyncError;
    use datasync_crypto::SignAlgorithm;
    use datasync_protocol::{ChangeState, KeyScheme, ObjectKey};
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl SyncObject for Note {
        const TYPE_NAME: &'static str = "Note";
        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.into(),
            body: body.into(),
        }
    }

    // Nothing listens here, so the engine stays disconnected.
    fn offline_config() -> SyncConfig {
        SyncConfig::new("offline", "127.0.0.1:9")
    }

    #[tokio::test]
    async fn offline_writes_are_queued() {
        let manager = Setup::new(offline_config()).start().await.unwrap();
        let store = manager.data_store();

        assert_eq!(store.save(&note("1", "first")).await.unwrap(), 1);
        assert_eq!(store.save(&note("1", "second")).await.unwrap(), 2);
        store.save(&note("2", "other")).await.unwrap();
        assert!(store.remove::<Note>("2").await.unwrap());
        assert!(!store.remove::<Note>("missing").await.unwrap());

        assert_eq!(store.load::<Note>("1").await.unwrap(), Some(note("1", "second")));
        assert_eq!(store.load::<Note>("2").await.unwrap(), None);
        assert_eq!(store.keys::<Note>().await.unwrap(), vec!["1".to_string()]);
        assert_eq!(store.count::<Note>().await.unwrap(), 1);
        assert_eq!(store.load_all::<Note>().await.unwrap(), vec![note("1", "second")]);

        let log = manager.local_store().change_log();
        assert_eq!(log.state(&ObjectKey::new("Note", "1")).unwrap(), ChangeState::Changed);
        assert_eq!(log.state(&ObjectKey::new("Note", "2")).unwrap(), ChangeState::Deleted);
        assert!(manager.device().unwrap().is_none());

        manager.finalize().await;
        assert!(manager.is_finalized());
        assert!(matches!(
            store.save(&note("3", "late")).await,
            Err(SyncError::ShutDown)
        ));
        manager.finalize().await;
    }

    #[tokio::test]
    async fn storage_path_persists_records_and_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("device.log");

        let fingerprint = {
            let manager = Setup::new(offline_config())
                .with_storage_path(&path)
                .start()
                .await
                .unwrap();
            manager.data_store().save(&note("1", "kept")).await.unwrap();
            manager.finalize().await;
            manager.fingerprint().to_string()
        };

        let manager = Setup::new(offline_config())
            .with_storage_path(&path)
            .start()
            .await
            .unwrap();
        assert_eq!(manager.fingerprint(), fingerprint);
        assert_eq!(
            manager.data_store().load::<Note>("1").await.unwrap(),
            Some(note("1", "kept"))
        );
        manager.finalize().await;
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let config = offline_config().with_sign_scheme(KeyScheme::new("rsa", Some("2048".into())));
        let result = Setup::new(config).start().await;
        assert!(matches!(result, Err(SyncError::Crypto(_))));

        let registry = CryptoRegistry::new(vec![SignAlgorithm::Ed25519], Vec::new());
        let result = Setup::new(offline_config()).with_registry(registry).start().await;
        assert!(matches!(result, Err(SyncError::Crypto(_))));
    }

    #[tokio::test]
    async fn resync_marks_every_record() {
        let manager = Setup::new(offline_config()).start().await.unwrap();
        let store = manager.data_store();
        store.save(&note("1", "a")).await.unwrap();
        store.save(&note("2", "b")).await.unwrap();
        let log = manager.local_store().change_log();
        log.mark_local_changed(&ObjectKey::new("Note", "1"), ChangeState::Unchanged)
            .unwrap();
        log.mark_local_changed(&ObjectKey::new("Note", "2"), ChangeState::Unchanged)
            .unwrap();

        assert_eq!(store.resync::<Note>().await.unwrap(), 2);
        assert_eq!(log.pending_count().unwrap(), 2);
        manager.finalize().await;
    }
}
