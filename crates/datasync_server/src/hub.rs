//! Routing of frames to connected devices.

use datasync_protocol::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Slot {
    session_id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// Registered sessions by device id.
///
/// A device has at most one live session; a newer session replaces an
/// older one.
#[derive(Default)]
pub struct SessionHub {
    sessions: RwLock<HashMap<Uuid, Slot>>,
}

impl SessionHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes frames for `device_id` to `outbound`.
    pub fn register(&self, device_id: Uuid, session_id: u64, outbound: mpsc::UnboundedSender<Frame>) {
        self.sessions.write().insert(
            device_id,
            Slot {
                session_id,
                outbound,
            },
        );
    }

    /// Removes the route if it still belongs to `session_id`.
    pub fn unregister(&self, device_id: Uuid, session_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&device_id) {
            Some(slot) if slot.session_id == session_id => {
                sessions.remove(&device_id);
                true
            }
            _ => false,
        }
    }

    /// Queues a frame for a device. Returns false if it is not connected.
    pub fn send(&self, device_id: Uuid, frame: Frame) -> bool {
        self.sessions
            .read()
            .get(&device_id)
            .is_some_and(|slot| slot.outbound.send(frame).is_ok())
    }

    /// Returns true if the device has a live session.
    pub fn is_connected(&self, device_id: Uuid) -> bool {
        self.sessions.read().contains_key(&device_id)
    }

    /// Number of connected devices.
    pub fn connected_count(&self) -> usize {
        self.sessions.read().len()
    }
}
