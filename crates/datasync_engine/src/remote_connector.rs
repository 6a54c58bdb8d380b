//! Connection to the relay server.
//!
//! The connector runs as its own task. It keeps one authenticated
//! connection open, reconnecting with backoff, and translates between
//! [`ChangeOperation`]s and signed, encrypted wire frames.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::keystore::{DeviceRecord, Keystore};
use crate::state::RemoteEvent;
use datasync_crypto::{CryptoError, CryptoIdentity, CryptoRegistry, Encryptor, Verifier};
use datasync_protocol::{
    checksum, read_frame, write_frame, Account, ChangeKind, ChangeMessage, ChangeOperation,
    Conflict, DeviceList, Download, DownloadAck, Frame, Identify, ObjectKey, ProtocolError,
    ProtocolResult, Ready, RecipientPayload, Register, UploadAck, WireMessage, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests from the engine to the connector.
#[derive(Debug)]
pub(crate) enum ConnectorCommand {
    /// Sign, encrypt and send a local change.
    Upload(ChangeOperation),
    /// Tell the server a download was applied.
    AckDownload { key: ObjectKey, version: u64 },
    /// Drop the current connection; the connector reconnects after backoff.
    Disconnect,
    /// Close the connection and stop.
    Shutdown(oneshot::Sender<()>),
}

/// Notifications from the connector to the engine.
#[derive(Debug)]
pub(crate) enum ConnectorEvent {
    /// Connectivity changed.
    Remote(RemoteEvent),
    /// A verified, decrypted change from another device.
    Download(ChangeOperation),
    /// The server accepted an upload.
    UploadAcked { key: ObjectKey, version: u64 },
    /// The server rejected an upload.
    Conflict {
        key: ObjectKey,
        version: u64,
        server_version: u64,
        current: Option<ChangeOperation>,
    },
    /// A non-retryable connection failure.
    Error(SyncError),
}

/// Keys of one device of the account.
struct Peer {
    verifier: Arc<dyn Verifier>,
    encryptor: Arc<dyn Encryptor>,
}

/// State of one registered connection.
struct Link {
    device: DeviceRecord,
    peers: HashMap<Uuid, Peer>,
    /// Queued downloads announced by `Ready` not yet acknowledged.
    backlog: u64,
}

enum SessionEnd {
    Closed,
    Stopped,
    Shutdown(oneshot::Sender<()>),
}

/// Owns the connection to the relay server.
pub(crate) struct RemoteConnector {
    config: SyncConfig,
    registry: Arc<CryptoRegistry>,
    identity: Arc<CryptoIdentity>,
    keystore: Keystore,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    commands: mpsc::UnboundedReceiver<ConnectorCommand>,
    registered: bool,
}

impl RemoteConnector {
    pub(crate) fn new(
        config: SyncConfig,
        registry: Arc<CryptoRegistry>,
        identity: Arc<CryptoIdentity>,
        keystore: Keystore,
        events: mpsc::UnboundedSender<ConnectorEvent>,
        commands: mpsc::UnboundedReceiver<ConnectorCommand>,
    ) -> Self {
        Self {
            config,
            registry,
            identity,
            keystore,
            events,
            commands,
            registered: false,
        }
    }

    /// Spawns the connector onto the current runtime.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.emit(ConnectorEvent::Remote(RemoteEvent::Connecting));
            self.registered = false;

            let end = self.session().await;
            match end {
                Ok(SessionEnd::Shutdown(ack)) => {
                    self.emit(ConnectorEvent::Remote(RemoteEvent::Disconnected));
                    let _ = ack.send(());
                    return;
                }
                Ok(SessionEnd::Stopped) => return,
                Ok(SessionEnd::Closed) => {
                    info!(remote = %self.config.remote_addr, "connection closed");
                }
                Err(e) if e.is_retryable() => {
                    warn!(remote = %self.config.remote_addr, error = %e, "connection failed");
                }
                Err(e) => {
                    warn!(remote = %self.config.remote_addr, error = %e, "connection failed, not retryable");
                    self.emit(ConnectorEvent::Error(e));
                }
            }
            self.emit(ConnectorEvent::Remote(RemoteEvent::Disconnected));

            attempt = if self.registered { 1 } else { attempt.saturating_add(1) };
            let delay = self.config.retry.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        None => return,
                        Some(ConnectorCommand::Shutdown(ack)) => {
                            let _ = ack.send(());
                            return;
                        }
                        // Offline: uploads are retried from the change log.
                        Some(_) => {}
                    },
                }
            }
        }
    }

    async fn session(&mut self) -> SyncResult<SessionEnd> {
        let deadline = self.config.handshake_timeout;
        let stream = timeout(deadline, TcpStream::connect(&self.config.remote_addr))
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        debug!(remote = %self.config.remote_addr, "connected");

        let (mut reader, mut writer) = stream.into_split();
        let (frames_tx, mut frames) = mpsc::channel::<ProtocolResult<Frame>>(64);
        let max_frame_size = self.config.max_frame_size;
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max_frame_size).await {
                    Ok(Some(frame)) => {
                        if frames_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = frames_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let result = match timeout(deadline, self.handshake(&mut writer, &mut frames)).await {
            Err(_) => Err(SyncError::Timeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(mut link)) => self.exchange(&mut link, &mut writer, &mut frames).await,
        };
        reader_task.abort();
        result
    }

    async fn handshake(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<ProtocolResult<Frame>>,
    ) -> SyncResult<Link> {
        let identify: Identify = expect(frames).await?;
        if identify.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::Registration(format!(
                "server speaks protocol {}, expected {PROTOCOL_VERSION}",
                identify.protocol_version
            )));
        }
        if identify.sign_scheme.algorithm != self.identity.sign_scheme().algorithm {
            return Err(SyncError::Registration(format!(
                "server requires signature algorithm {}",
                identify.sign_scheme.algorithm
            )));
        }

        let stored = self.keystore.device()?;
        let register = Register {
            device_name: self.config.device_name.clone(),
            account: stored.map(|d| d.account_id).or(self.config.account),
            sign_scheme: self.identity.sign_scheme(),
            sign_key: self.identity.sign_key(),
            crypt_scheme: self.identity.crypt_scheme(),
            crypt_key: self.identity.crypt_key(),
            nonce_signature: self.identity.sign(&identify.nonce),
            nonce: identify.nonce,
        };
        write_frame(writer, &Frame::new(&register)?).await?;

        let account: Account = expect(frames).await?;
        let device = DeviceRecord {
            device_id: account.device_id,
            account_id: account.account_id,
        };
        if stored != Some(device) {
            self.keystore.save_device(device)?;
            info!(device_id = %device.device_id, account_id = %device.account_id, "device registered");
        }

        let devices: DeviceList = expect(frames).await?;
        let peers = self.peers(&devices)?;
        let ready: Ready = expect(frames).await?;
        self.registered = true;

        info!(
            device_id = %device.device_id,
            peers = peers.len(),
            pending = ready.pending,
            "sync connection ready"
        );
        let event = if ready.pending == 0 {
            RemoteEvent::ReadyNoChanges
        } else {
            RemoteEvent::ReadyWithChanges
        };
        self.emit(ConnectorEvent::Remote(event));

        Ok(Link {
            device,
            peers,
            backlog: ready.pending,
        })
    }

    async fn exchange(
        &mut self,
        link: &mut Link,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<ProtocolResult<Frame>>,
    ) -> SyncResult<SessionEnd> {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(frame)) => self.handle_frame(link, writer, frame).await?,
                },
                cmd = self.commands.recv() => match cmd {
                    None => return Ok(SessionEnd::Stopped),
                    Some(ConnectorCommand::Upload(op)) => self.upload(link, writer, op).await?,
                    Some(ConnectorCommand::AckDownload { key, version }) => {
                        self.ack_download(link, writer, key, version).await?;
                    }
                    Some(ConnectorCommand::Disconnect) => return Ok(SessionEnd::Closed),
                    Some(ConnectorCommand::Shutdown(ack)) => return Ok(SessionEnd::Shutdown(ack)),
                },
            }
        }
    }

    async fn handle_frame(
        &mut self,
        link: &mut Link,
        writer: &mut OwnedWriteHalf,
        frame: Frame,
    ) -> SyncResult<()> {
        if frame.is::<Download>() {
            let download: Download = frame.decode()?;
            let message: ChangeMessage = download.frame.decode()?;
            match self.open(link, &download.frame, &message) {
                Ok(op) => self.emit(ConnectorEvent::Download(op)),
                Err(e) => {
                    warn!(key = %message.key, sender = %message.sender, error = %e, "dropping unreadable download");
                    self.ack_download(link, writer, message.key, message.version).await?;
                }
            }
        } else if frame.is::<UploadAck>() {
            let ack: UploadAck = frame.decode()?;
            self.emit(ConnectorEvent::UploadAcked {
                key: ack.key,
                version: ack.version,
            });
        } else if frame.is::<Conflict>() {
            let conflict: Conflict = frame.decode()?;
            let current = conflict.current.as_ref().and_then(|current| {
                let message: ChangeMessage = current.decode().ok()?;
                self.open(link, current, &message)
                    .map_err(|e| warn!(key = %conflict.key, error = %e, "unreadable conflict state"))
                    .ok()
            });
            debug!(key = %conflict.key, version = conflict.version, server_version = conflict.server_version, "upload conflict");
            self.emit(ConnectorEvent::Conflict {
                key: conflict.key,
                version: conflict.version,
                server_version: conflict.server_version,
                current,
            });
        } else if frame.is::<DeviceList>() {
            let devices: DeviceList = frame.decode()?;
            link.peers = self.peers(&devices)?;
            info!(peers = link.peers.len(), "device list updated");
        } else {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Download, UploadAck, Conflict or DeviceList",
                actual: frame.message_type,
            }
            .into());
        }
        Ok(())
    }

    async fn upload(
        &self,
        link: &Link,
        writer: &mut OwnedWriteHalf,
        op: ChangeOperation,
    ) -> SyncResult<()> {
        let mut payloads = Vec::new();
        if let Some(value) = &op.value {
            for (device_id, peer) in &link.peers {
                payloads.push(RecipientPayload {
                    device_id: *device_id,
                    ciphertext: peer.encryptor.encrypt(value)?,
                });
            }
        }

        let message = ChangeMessage {
            sender: link.device.device_id,
            checksum: op.checksum(),
            kind: if op.value.is_some() {
                ChangeKind::Upload
            } else {
                ChangeKind::Remove
            },
            key: op.key,
            version: op.version,
            payloads,
        };
        debug!(key = %message.key, version = message.version, recipients = message.payloads.len(), "uploading");
        self.send_signed(writer, &message).await
    }

    async fn ack_download(
        &self,
        link: &mut Link,
        writer: &mut OwnedWriteHalf,
        key: ObjectKey,
        version: u64,
    ) -> SyncResult<()> {
        self.send_signed(writer, &DownloadAck { key, version }).await?;
        if link.backlog > 0 {
            link.backlog -= 1;
            if link.backlog == 0 {
                debug!("queued downloads applied");
                self.emit(ConnectorEvent::Remote(RemoteEvent::ReadyNoChanges));
            }
        }
        Ok(())
    }

    async fn send_signed<M: WireMessage>(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &M,
    ) -> SyncResult<()> {
        let frame = Frame::new(message)?;
        let signature = self.identity.sign(&frame.signed_bytes());
        write_frame(writer, &frame.with_signature(signature)).await?;
        Ok(())
    }

    /// Verifies the sender's signature and decrypts this device's payload.
    fn open(&self, link: &Link, frame: &Frame, message: &ChangeMessage) -> SyncResult<ChangeOperation> {
        let peer = link.peers.get(&message.sender).ok_or_else(|| {
            CryptoError::InvalidKey(format!("unknown sender {}", message.sender))
        })?;
        peer.verifier.verify(&frame.signed_bytes(), &frame.signature)?;

        let value = match message.kind {
            ChangeKind::Remove => None,
            ChangeKind::Upload | ChangeKind::Download => {
                let ciphertext = message
                    .payload_for(link.device.device_id)
                    .ok_or(CryptoError::Decryption)?;
                let value = self.identity.decrypt(ciphertext)?;
                if message.checksum != Some(checksum(&value)) {
                    return Err(SyncError::Codec(format!(
                        "checksum mismatch for {}",
                        message.key
                    )));
                }
                Some(value)
            }
        };
        Ok(ChangeOperation::download(message.key.clone(), value, message.version))
    }

    fn peers(&self, devices: &DeviceList) -> SyncResult<HashMap<Uuid, Peer>> {
        let mut peers = HashMap::with_capacity(devices.devices.len());
        for device in &devices.devices {
            let peer = Peer {
                verifier: self.registry.verifier(&device.sign_scheme, &device.sign_key)?,
                encryptor: self.registry.encryptor(&device.crypt_scheme, &device.crypt_key)?,
            };
            peers.insert(device.device_id, peer);
        }
        Ok(peers)
    }

    fn emit(&self, event: ConnectorEvent) {
        // The engine outlives the connector; a closed channel means shutdown.
        let _ = self.events.send(event);
    }
}

async fn expect<M: WireMessage>(frames: &mut mpsc::Receiver<ProtocolResult<Frame>>) -> SyncResult<M> {
    match frames.recv().await {
        Some(frame) => Ok(frame?.decode()?),
        None => Err(SyncError::transport_retryable(format!(
            "connection closed while waiting for {}",
            M::TYPE_NAME
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use datasync_protocol::DeviceInfo;
    use datasync_storage::InMemoryBackend;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Fixture {
        keystore: Keystore,
        events: mpsc::UnboundedReceiver<ConnectorEvent>,
        commands: mpsc::UnboundedSender<ConnectorCommand>,
        identity: Arc<CryptoIdentity>,
        handle: JoinHandle<()>,
    }

    fn start(addr: String, handshake_timeout: Duration) -> Fixture {
        let registry = Arc::new(CryptoRegistry::default());
        let config = SyncConfig::new("test", addr)
            .with_device_name("laptop")
            .with_handshake_timeout(handshake_timeout)
            .with_retry(RetryConfig::new(Duration::from_millis(20)).with_jitter(false));
        let keystore = Keystore::new(Arc::new(InMemoryBackend::new()));
        let identity = Arc::new(
            keystore
                .load_or_create_identity(&registry, &config.sign_scheme, &config.crypt_scheme)
                .unwrap(),
        );
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let connector = RemoteConnector::new(
            config,
            registry,
            Arc::clone(&identity),
            keystore.clone(),
            events_tx,
            commands_rx,
        );
        Fixture {
            keystore,
            events,
            commands,
            identity,
            handle: connector.spawn(),
        }
    }

    async fn next_remote(events: &mut mpsc::UnboundedReceiver<ConnectorEvent>) -> RemoteEvent {
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
                ConnectorEvent::Remote(event) => return event,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn handshake_registers_and_reports_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut fx = start(addr, Duration::from_secs(5));
        let device_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();

        let (mut socket, _) = listener.accept().await.unwrap();
        let nonce = vec![7u8; 32];
        let identify = Identify {
            nonce: nonce.clone(),
            sign_scheme: fx.identity.sign_scheme(),
            protocol_version: PROTOCOL_VERSION,
        };
        write_frame(&mut socket, &Frame::new(&identify).unwrap()).await.unwrap();

        let register: Register = read_frame(&mut socket, 1 << 20)
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(register.device_name, "laptop");
        assert_eq!(register.nonce, nonce);
        fx.identity
            .verifier(&CryptoRegistry::default())
            .unwrap()
            .verify(&nonce, &register.nonce_signature)
            .unwrap();

        let account = Account { device_id, account_id };
        write_frame(&mut socket, &Frame::new(&account).unwrap()).await.unwrap();
        let devices = DeviceList {
            devices: vec![DeviceInfo {
                device_id,
                device_name: register.device_name.clone(),
                sign_scheme: register.sign_scheme.clone(),
                sign_key: register.sign_key.clone(),
                crypt_scheme: register.crypt_scheme.clone(),
                crypt_key: register.crypt_key.clone(),
            }],
        };
        write_frame(&mut socket, &Frame::new(&devices).unwrap()).await.unwrap();
        write_frame(&mut socket, &Frame::new(&Ready { pending: 0 }).unwrap()).await.unwrap();

        assert_eq!(next_remote(&mut fx.events).await, RemoteEvent::Connecting);
        assert_eq!(next_remote(&mut fx.events).await, RemoteEvent::ReadyNoChanges);
        assert_eq!(
            fx.keystore.device().unwrap(),
            Some(DeviceRecord { device_id, account_id })
        );

        // Uploads are signed and sealed for every listed device.
        let op = ChangeOperation::upload(datasync_protocol::StoredRecord::new(
            ObjectKey::new("Todo", "1"),
            b"buy milk".to_vec(),
            1,
        ));
        fx.commands.send(ConnectorCommand::Upload(op)).unwrap();
        let frame = read_frame(&mut socket, 1 << 20).await.unwrap().unwrap();
        assert!(frame.is_signed());
        let message: ChangeMessage = frame.decode().unwrap();
        assert_eq!(message.sender, device_id);
        let sealed = message.payload_for(device_id).unwrap();
        assert_eq!(fx.identity.decrypt(sealed).unwrap(), b"buy milk".to_vec());

        let (ack_tx, ack_rx) = oneshot::channel();
        fx.commands.send(ConnectorCommand::Shutdown(ack_tx)).unwrap();
        ack_rx.await.unwrap();
        fx.handle.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_hits_handshake_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut fx = start(addr, Duration::from_millis(100));

        let (_socket, _) = listener.accept().await.unwrap();
        assert_eq!(next_remote(&mut fx.events).await, RemoteEvent::Connecting);
        assert_eq!(next_remote(&mut fx.events).await, RemoteEvent::Disconnected);
        assert_eq!(next_remote(&mut fx.events).await, RemoteEvent::Connecting);
        assert_eq!(fx.keystore.device().unwrap(), None);

        let (ack_tx, ack_rx) = oneshot::channel();
        fx.commands.send(ConnectorCommand::Shutdown(ack_tx)).unwrap();
        ack_rx.await.unwrap();
    }
}
