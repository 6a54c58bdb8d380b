//! Client synchronization state machine.
//!
//! The machine is pure: it consumes events and returns the actions the
//! engine must perform on the change controller and remote connector.

/// Observable synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Connecting and registering with the server.
    Initializing,
    /// No connection; a reconnect is scheduled.
    Disconnected,
    /// Receiving queued remote changes; uploads are paused.
    Downloading,
    /// Local changes are in flight.
    Uploading,
    /// Nothing pending in either direction.
    Synchronized,
    /// Halted by an error until the next connection attempt.
    Error,
}

impl SyncState {
    /// Returns true while a connection is being used to exchange changes.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Downloading | SyncState::Uploading)
    }

    /// Returns true if the device is connected and idle.
    pub fn is_synchronized(&self) -> bool {
        *self == SyncState::Synchronized
    }
}

/// Connectivity events reported by the remote connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEvent {
    /// A connection attempt started.
    Connecting,
    /// The connection was lost or closed.
    Disconnected,
    /// Registered and nothing is queued for this device.
    ReadyNoChanges,
    /// Registered and queued downloads are following.
    ReadyWithChanges,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Turn the controller's upload emission on or off.
    EnableUploads(bool),
    /// Forget all unacknowledged uploads; their change-log rows stay.
    ClearUploads,
    /// Drop the current connection.
    Disconnect,
}

/// The `SyncState` transition function.
#[derive(Debug, Clone)]
pub struct SyncStateMachine {
    state: SyncState,
    last_error: Option<String>,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    /// Creates a machine in `Initializing`.
    pub fn new() -> Self {
        Self {
            state: SyncState::Initializing,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Text of the error that caused the current `Error` state, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Applies a connectivity event.
    ///
    /// While in `Error`, only `Connecting` is accepted.
    pub fn on_remote_event(&mut self, event: RemoteEvent) -> Vec<EngineAction> {
        if self.state == SyncState::Error && event != RemoteEvent::Connecting {
            return Vec::new();
        }
        match event {
            RemoteEvent::Connecting => {
                self.state = SyncState::Initializing;
                self.last_error = None;
                vec![EngineAction::EnableUploads(false), EngineAction::ClearUploads]
            }
            RemoteEvent::Disconnected => {
                self.state = SyncState::Disconnected;
                vec![EngineAction::EnableUploads(false), EngineAction::ClearUploads]
            }
            RemoteEvent::ReadyNoChanges => {
                self.state = SyncState::Uploading;
                vec![EngineAction::EnableUploads(true)]
            }
            RemoteEvent::ReadyWithChanges => {
                self.state = SyncState::Downloading;
                vec![EngineAction::EnableUploads(false)]
            }
        }
    }

    /// Applies a change of the controller's uploading flag.
    pub fn on_uploading_changed(&mut self, uploading: bool) {
        match (self.state, uploading) {
            (SyncState::Error, _) => {}
            (_, true) => self.state = SyncState::Uploading,
            (SyncState::Uploading, false) => self.state = SyncState::Synchronized,
            _ => {}
        }
    }

    /// Applies a controller error.
    pub fn on_controller_error(&mut self, message: impl Into<String>) -> Vec<EngineAction> {
        let message = message.into();
        self.last_error = Some(if message.is_empty() {
            "unknown error".to_string()
        } else {
            message
        });
        self.state = SyncState::Error;
        vec![
            EngineAction::EnableUploads(false),
            EngineAction::Disconnect,
            EngineAction::ClearUploads,
        ]
    }
}
