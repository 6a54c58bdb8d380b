//! One device connection.
//!
//! A session starts `Authenticating` with a fresh nonce and moves to
//! `Registered` once the device proves possession of its signing key.
//! Every inbound frame is processed on its own task, bounded by the
//! server-wide worker semaphore; teardown waits for those tasks.

use crate::config::ServerConfig;
use crate::database::{DatabaseController, DeviceRow, IndexOutcome};
use crate::error::{ServerError, ServerResult};
use crate::hub::SessionHub;
use datasync_crypto::Verifier;
use datasync_protocol::{
    read_frame, write_frame, Account, ChangeMessage, Conflict, DeviceList, Download, DownloadAck,
    Frame, Identify, KeyScheme, Ready, Register, UploadAck, WireMessage, NONCE_SIZE,
    PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Server-wide state shared by all sessions.
pub(crate) struct SessionContext {
    pub config: ServerConfig,
    pub database: Arc<DatabaseController>,
    pub hub: Arc<SessionHub>,
    pub workers: Arc<Semaphore>,
    pub sign_scheme: KeyScheme,
}

#[derive(Clone)]
struct RegisteredDevice {
    device_id: Uuid,
    account_id: Uuid,
    verifier: Arc<dyn Verifier>,
}

enum SessionState {
    Authenticating { nonce: Vec<u8> },
    Registered(RegisteredDevice),
}

struct Session {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
    run_count: AtomicUsize,
    outbound: mpsc::UnboundedSender<Frame>,
    closing: AtomicBool,
    close: Notify,
}

/// Decrements the running-task counter even if the task panics.
struct RunGuard(Arc<Session>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.run_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves one connection until the peer leaves, the handshake deadline
/// passes or a frame fails.
pub(crate) async fn serve(ctx: Arc<SessionContext>, stream: TcpStream, peer: SocketAddr, id: u64) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut nonce = vec![0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let session = Arc::new(Session {
        id,
        peer,
        ctx: Arc::clone(&ctx),
        state: Mutex::new(SessionState::Authenticating {
            nonce: nonce.clone(),
        }),
        run_count: AtomicUsize::new(0),
        outbound,
        closing: AtomicBool::new(false),
        close: Notify::new(),
    });
    debug!(session = id, %peer, "connection accepted");

    let identify = Identify {
        nonce,
        sign_scheme: ctx.sign_scheme.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    if let Err(e) = session.send(&identify) {
        session.fail(e);
    }

    let deadline = tokio::time::Instant::now() + ctx.config.handshake_timeout;
    loop {
        tokio::select! {
            () = session.close.notified() => break,
            () = tokio::time::sleep_until(deadline), if !session.is_registered() => {
                info!(session = id, %peer, "registration deadline elapsed, closing connection");
                break;
            }
            read = read_frame(&mut reader, ctx.config.max_frame_size) => match read {
                Ok(Some(frame)) => {
                    let Ok(permit) = Arc::clone(&ctx.workers).acquire_owned().await else {
                        break;
                    };
                    let registering = !session.is_registered();
                    session.run_count.fetch_add(1, Ordering::SeqCst);
                    let guard = RunGuard(Arc::clone(&session));
                    let task = tokio::spawn(async move {
                        let _permit = permit;
                        guard.0.process(frame).await;
                        drop(guard);
                    });
                    // Nothing may overtake the registration.
                    if registering {
                        let _ = task.await;
                    }
                }
                Ok(None) => {
                    debug!(session = id, %peer, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(session = id, %peer, error = %e, "data stream error, closing connection");
                    break;
                }
            }
        }
    }

    session.closing.store(true, Ordering::SeqCst);
    while session.run_count.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(ctx.config.teardown_poll).await;
    }
    if let Some(device_id) = session.device_id() {
        ctx.hub.unregister(device_id, id);
        info!(session = id, %device_id, "device disconnected");
    }
    drop(session);

    // Flush frames already queued, but never wait on a stalled peer forever.
    if tokio::time::timeout(ctx.config.handshake_timeout, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

impl Session {
    fn is_registered(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Registered(_))
    }

    fn device_id(&self) -> Option<Uuid> {
        match &*self.state.lock() {
            SessionState::Registered(device) => Some(device.device_id),
            SessionState::Authenticating { .. } => None,
        }
    }

    async fn process(self: &Arc<Self>, frame: Frame) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.handle(frame).await {
            self.fail(e);
        }
    }

    async fn handle(self: &Arc<Self>, frame: Frame) -> ServerResult<()> {
        let state = match &*self.state.lock() {
            SessionState::Authenticating { nonce } => Err(nonce.clone()),
            SessionState::Registered(device) => Ok(device.clone()),
        };
        let device = match state {
            Err(nonce) => return self.register(frame, nonce).await,
            Ok(device) => device,
        };

        device
            .verifier
            .verify(&frame.signed_bytes(), &frame.signature)?;
        if frame.is::<ChangeMessage>() {
            self.upload(device, frame).await
        } else if frame.is::<DownloadAck>() {
            let ack: DownloadAck = frame.decode()?;
            let db = Arc::clone(&self.ctx.database);
            let removed = blocking(move || {
                db.acknowledge(device.account_id, device.device_id, &ack.key, ack.version)
            })
            .await?;
            debug!(session = self.id, removed, "download acknowledged");
            Ok(())
        } else {
            Err(ServerError::Client(format!(
                "unexpected {} from registered device",
                frame.message_type
            )))
        }
    }

    async fn register(self: &Arc<Self>, frame: Frame, nonce: Vec<u8>) -> ServerResult<()> {
        if !frame.is::<Register>() {
            return Err(ServerError::Client(format!(
                "expected {}, got {}",
                Register::TYPE_NAME,
                frame.message_type
            )));
        }
        let register: Register = frame.decode()?;
        if register.nonce != nonce {
            return Err(ServerError::Client("nonce mismatch".into()));
        }

        let registry = &self.ctx.config.registry;
        let verifier = registry.verifier(&register.sign_scheme, &register.sign_key)?;
        verifier.verify(&register.nonce, &register.nonce_signature)?;
        registry.crypt_algorithm(&register.crypt_scheme)?;

        let db = Arc::clone(&self.ctx.database);
        let row = blocking(move || db.add_device(&register)).await?;
        *self.state.lock() = SessionState::Registered(RegisteredDevice {
            device_id: row.device_id,
            account_id: row.account_id,
            verifier,
        });
        self.send(&Account {
            device_id: row.device_id,
            account_id: row.account_id,
        })?;

        let session = Arc::clone(self);
        let (device_id, account_id) = (row.device_id, row.account_id);
        let pending = blocking(move || session.announce(device_id, account_id)).await?;
        info!(
            session = self.id,
            peer = %self.peer,
            %device_id,
            %account_id,
            pending,
            "device ready"
        );
        Ok(())
    }

    /// Joins the hub, publishes the device list and replays the outbox.
    fn announce(&self, device_id: Uuid, account_id: Uuid) -> ServerResult<usize> {
        let db = &self.ctx.database;
        db.with_account_lock(account_id, || -> ServerResult<usize> {
            self.ctx.hub.register(device_id, self.id, self.outbound.clone());

            let devices = db.devices_of(account_id)?;
            let list = Frame::new(&DeviceList {
                devices: devices.iter().map(DeviceRow::info).collect(),
            })?;
            for device in devices.iter().filter(|d| d.device_id != device_id) {
                self.ctx.hub.send(device.device_id, list.clone());
            }
            self.send_frame(list);

            let pending = db.pending_downloads(device_id)?;
            self.send(&Ready {
                pending: pending.len() as u64,
            })?;
            for (_, entry) in &pending {
                self.send(&Download {
                    frame: entry.frame.clone(),
                })?;
            }
            Ok(pending.len())
        })
    }

    async fn upload(self: &Arc<Self>, device: RegisteredDevice, frame: Frame) -> ServerResult<()> {
        let change: ChangeMessage = frame.decode()?;
        if change.sender != device.device_id {
            return Err(ServerError::Client(format!(
                "change from {} sent by {}",
                change.sender, device.device_id
            )));
        }
        let session = Arc::clone(self);
        blocking(move || session.relay(&device, frame, change)).await
    }

    /// Indexes a change and relays it, or answers with a conflict.
    ///
    /// Runs under the account lock so the acknowledgement reaches the
    /// uploader after every relay indexed before it.
    fn relay(&self, device: &RegisteredDevice, frame: Frame, change: ChangeMessage) -> ServerResult<()> {
        let db = &self.ctx.database;
        db.with_account_lock(device.account_id, || -> ServerResult<()> {
            match db.index_change(device.account_id, &frame, &change)? {
                IndexOutcome::Accepted { recipients } => {
                    let download = Frame::new(&Download { frame })?;
                    let online = recipients
                        .iter()
                        .filter(|r| self.ctx.hub.send(**r, download.clone()))
                        .count();
                    self.send(&UploadAck {
                        key: change.key.clone(),
                        version: change.version,
                    })?;
                    debug!(
                        session = self.id,
                        key = %change.key,
                        version = change.version,
                        recipients = recipients.len(),
                        online,
                        "change relayed"
                    );
                }
                IndexOutcome::Conflict {
                    server_version,
                    current,
                } => {
                    debug!(
                        session = self.id,
                        key = %change.key,
                        version = change.version,
                        server_version,
                        "stale upload rejected"
                    );
                    self.send(&Conflict {
                        key: change.key.clone(),
                        version: change.version,
                        server_version,
                        current,
                    })?;
                }
            }
            Ok(())
        })
    }

    fn send<M: WireMessage>(&self, message: &M) -> ServerResult<()> {
        self.send_frame(Frame::new(message)?);
        Ok(())
    }

    fn send_frame(&self, frame: Frame) {
        // A closed queue means the writer already stopped.
        let _ = self.outbound.send(frame);
    }

    fn fail(&self, error: ServerError) {
        match &error {
            ServerError::Database(_) | ServerError::Io(_) | ServerError::Internal(_) => warn!(
                session = self.id,
                peer = %self.peer,
                error = %error,
                transient = error.is_transient(),
                "database error, likely transient; closing connection"
            ),
            ServerError::Crypto(_) => info!(
                session = self.id,
                peer = %self.peer,
                "verification failed, closing connection"
            ),
            _ => info!(
                session = self.id,
                peer = %self.peer,
                error = %error,
                "protocol violation, closing connection"
            ),
        }
        self.closing.store(true, Ordering::SeqCst);
        self.close.notify_one();
    }
}

async fn blocking<R, F>(f: F) -> ServerResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> ServerResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?
}
