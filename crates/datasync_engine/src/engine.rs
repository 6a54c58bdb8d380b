//! The exchange engine.
//!
//! One task owns the [`ChangeController`] and the [`SyncStateMachine`]; it
//! consumes connector events and local-change notifications in order and
//! publishes the resulting [`SyncState`].

use crate::change_controller::{ChangeController, DownloadOutcome};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::keystore::Keystore;
use crate::local_store::LocalStore;
use crate::remote_connector::{ConnectorCommand, ConnectorEvent, RemoteConnector};
use crate::resolver::ConflictResolver;
use crate::state::{EngineAction, SyncState, SyncStateMachine};
use datasync_crypto::{CryptoIdentity, CryptoRegistry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Called with the error text before the process aborts on unrecoverable
/// local state. The process aborts when the handler returns.
pub type FatalHandler = Arc<dyn Fn(&str, &FatalContext) + Send + Sync>;

/// Where a fatal error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalContext {
    /// Name of the sync setup.
    pub setup: String,
    /// Module path.
    pub module: &'static str,
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
}

impl fmt::Display for FatalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}:{})", self.setup, self.module, self.file, self.line)
    }
}

const CONNECTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) enum EngineRequest {
    LocalChanged,
    Finalize(oneshot::Sender<()>),
}

/// Everything the engine task needs.
pub(crate) struct EngineParts {
    pub config: SyncConfig,
    pub store: Arc<LocalStore>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub registry: Arc<CryptoRegistry>,
    pub identity: Arc<CryptoIdentity>,
    pub keystore: Keystore,
    pub fatal: Option<FatalHandler>,
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    requests: mpsc::UnboundedSender<EngineRequest>,
    state: watch::Receiver<SyncState>,
    last_error: watch::Receiver<Option<String>>,
    done: watch::Receiver<bool>,
}

impl EngineHandle {
    pub(crate) fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub(crate) fn notify_local_change(&self) {
        let _ = self.requests.send(EngineRequest::LocalChanged);
    }

    pub(crate) fn is_finalized(&self) -> bool {
        *self.done.borrow()
    }

    /// Stops the engine and waits until it has shut down. Safe to call
    /// more than once and from several handles.
    pub(crate) async fn finalize(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(EngineRequest::Finalize(tx)).is_ok() {
            let _ = rx.await;
        }
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Starts the connector and engine tasks on the current runtime.
pub(crate) fn spawn(parts: EngineParts) -> EngineHandle {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SyncState::Initializing);
    let (error_tx, error_rx) = watch::channel(None);
    let (done_tx, done_rx) = watch::channel(false);

    let setup_name = parts.config.setup_name.clone();
    let connector = RemoteConnector::new(
        parts.config,
        parts.registry,
        parts.identity,
        parts.keystore,
        events_tx,
        commands_rx,
    )
    .spawn();

    let engine = ExchangeEngine {
        setup_name,
        controller: ChangeController::new(Arc::clone(&parts.store), parts.resolver, commands_tx.clone()),
        store: parts.store,
        machine: SyncStateMachine::new(),
        connector: commands_tx,
        connector_task: Some(connector),
        state_tx,
        error_tx,
        fatal: parts.fatal,
    };
    tokio::spawn(engine.run(requests_rx, events_rx, done_tx));

    EngineHandle {
        requests: requests_tx,
        state: state_rx,
        last_error: error_rx,
        done: done_rx,
    }
}

struct ExchangeEngine {
    setup_name: String,
    store: Arc<LocalStore>,
    machine: SyncStateMachine,
    controller: ChangeController,
    connector: mpsc::UnboundedSender<ConnectorCommand>,
    connector_task: Option<JoinHandle<()>>,
    state_tx: watch::Sender<SyncState>,
    error_tx: watch::Sender<Option<String>>,
    fatal: Option<FatalHandler>,
}

impl ExchangeEngine {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<EngineRequest>,
        mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
        done: watch::Sender<bool>,
    ) {
        info!(setup = %self.setup_name, "sync engine started");
        let mut connector_open = true;

        let finalize_ack = loop {
            tokio::select! {
                biased;
                event = events.recv(), if connector_open => match event {
                    Some(event) => self.on_connector_event(event),
                    None => connector_open = false,
                },
                request = requests.recv() => match request {
                    Some(EngineRequest::LocalChanged) => self.step(|c| c.drain().map(|_| ())),
                    Some(EngineRequest::Finalize(ack)) => break Some(ack),
                    None => break None,
                },
            }
            self.publish();
        };

        self.shutdown().await;
        let setup_name = std::mem::take(&mut self.setup_name);
        // Release the store before signalling completion.
        drop(self);
        while events.try_recv().is_ok() {}
        info!(setup = %setup_name, "sync engine stopped");
        done.send_replace(true);
        if let Some(ack) = finalize_ack {
            let _ = ack.send(());
        }
    }

    fn on_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Remote(remote) => {
                debug!(event = ?remote, "connectivity event");
                let actions = self.machine.on_remote_event(remote);
                self.perform(actions);
            }
            ConnectorEvent::Download(op) => self.step(|c| {
                if c.apply_download(op)? == DownloadOutcome::Resolved {
                    c.drain()?;
                }
                Ok(())
            }),
            ConnectorEvent::UploadAcked { key, version } => {
                self.step(|c| c.upload_done(&key, version));
            }
            ConnectorEvent::Conflict {
                key,
                version,
                server_version,
                current,
            } => self.step(|c| c.handle_conflict(&key, version, server_version, current)),
            ConnectorEvent::Error(e) => self.fail(e),
        }
    }

    /// Runs a controller operation and feeds uploading-flag changes and
    /// errors into the state machine.
    fn step(&mut self, f: impl FnOnce(&mut ChangeController) -> SyncResult<()>) {
        let was_uploading = self.controller.is_uploading();
        match f(&mut self.controller) {
            Ok(()) => {
                let uploading = self.controller.is_uploading();
                if uploading != was_uploading {
                    self.machine.on_uploading_changed(uploading);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn perform(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::EnableUploads(enabled) => {
                    if let Err(e) = self.controller.set_uploading_enabled(enabled) {
                        self.fail(e);
                        return;
                    }
                    if enabled {
                        let uploading = self.controller.is_uploading();
                        self.machine.on_uploading_changed(uploading);
                    }
                }
                EngineAction::ClearUploads => self.controller.clear_uploads(),
                EngineAction::Disconnect => {
                    let _ = self.connector.send(ConnectorCommand::Disconnect);
                }
            }
        }
    }

    fn fail(&mut self, error: SyncError) {
        if error.is_fatal() {
            self.fatal(&error, file!(), line!());
        }
        warn!(setup = %self.setup_name, error = %error, "sync error");
        let actions = self.machine.on_controller_error(error.to_string());
        self.perform(actions);
    }

    fn fatal(&self, error: &SyncError, file: &'static str, line: u32) -> ! {
        let context = FatalContext {
            setup: self.setup_name.clone(),
            module: module_path!(),
            file,
            line,
        };
        let message = error.to_string();
        error!(context = %context, error = %message, "unrecoverable local state");
        if let Some(handler) = &self.fatal {
            handler(&message, &context);
        }
        error!(context = %context, "aborting");
        std::process::abort();
    }

    fn publish(&self) {
        let state = self.machine.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(setup = %self.setup_name, ?state, "sync state changed");
        }

        let last_error = self.machine.last_error().map(str::to_string);
        self.error_tx.send_if_modified(|current| {
            if *current == last_error {
                false
            } else {
                current.clone_from(&last_error);
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.connector.send(ConnectorCommand::Shutdown(tx)).is_ok()
            && tokio::time::timeout(CONNECTOR_SHUTDOWN_TIMEOUT, rx).await.is_err()
        {
            warn!(setup = %self.setup_name, "connector did not stop in time");
        }
        if let Some(task) = self.connector_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.controller.clear_uploads();
        if let Err(e) = self.store.backend().sync() {
            warn!(setup = %self.setup_name, error = %e, "final sync of local store failed");
        }
    }
}
