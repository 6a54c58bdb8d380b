//! Protocol-level tests against a running server.

use datasync_crypto::{CryptoIdentity, CryptoRegistry, CryptAlgorithm, SignAlgorithm};
use datasync_protocol::{
    checksum, read_frame, write_frame, Account, ChangeKind, ChangeMessage, Conflict, DeviceList,
    Download, DownloadAck, Frame, Identify, ObjectKey, Ready, RecipientPayload, Register,
    UploadAck, WireMessage, DEFAULT_MAX_FRAME_SIZE,
};
use datasync_server::{DatabaseController, ServerConfig, SyncServer};
use datasync_storage::InMemoryBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn start(config: ServerConfig) -> (SocketAddr, Arc<DatabaseController>) {
    let config = ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..config
    };
    let server = SyncServer::bind(config, Arc::new(InMemoryBackend::new()))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let database = Arc::clone(server.database());
    tokio::spawn(server.run());
    (addr, database)
}

fn identity() -> CryptoIdentity {
    CryptoIdentity::generate(
        &CryptoRegistry::default(),
        &SignAlgorithm::Ed25519.scheme(),
        &CryptAlgorithm::X25519XSalsa20Poly1305.scheme(),
    )
    .unwrap()
}

struct RawClient {
    identity: CryptoIdentity,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    account: Option<Account>,
}

impl RawClient {
    async fn connect(addr: SocketAddr, identity: CryptoIdentity) -> (Self, Identify) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            identity,
            reader,
            writer,
            account: None,
        };
        let identify = client.expect::<Identify>().await;
        (client, identify)
    }

    /// Connects and completes registration, returning the queued downloads.
    async fn register(
        addr: SocketAddr,
        identity: CryptoIdentity,
        account: Option<Uuid>,
    ) -> (Self, Vec<Download>) {
        let (mut client, identify) = Self::connect(addr, identity).await;
        let register = client.register_message(&identify, account);
        client.send(Frame::new(&register).unwrap()).await;

        let issued = client.expect::<Account>().await;
        client.account = Some(issued);
        client.expect::<DeviceList>().await;
        let ready = client.expect::<Ready>().await;
        let mut pending = Vec::new();
        for _ in 0..ready.pending {
            pending.push(client.expect::<Download>().await);
        }
        (client, pending)
    }

    fn register_message(&self, identify: &Identify, account: Option<Uuid>) -> Register {
        Register {
            device_name: "test".into(),
            account,
            sign_scheme: self.identity.sign_scheme(),
            sign_key: self.identity.sign_key(),
            crypt_scheme: self.identity.crypt_scheme(),
            crypt_key: self.identity.crypt_key(),
            nonce: identify.nonce.clone(),
            nonce_signature: self.identity.sign(&identify.nonce),
        }
    }

    fn device_id(&self) -> Uuid {
        self.account.unwrap().device_id
    }

    fn account_id(&self) -> Uuid {
        self.account.unwrap().account_id
    }

    fn signed<M: WireMessage>(&self, message: &M) -> Frame {
        let frame = Frame::new(message).unwrap();
        let signature = self.identity.sign(&frame.signed_bytes());
        frame.with_signature(signature)
    }

    /// A change sealed for `recipients` besides this device.
    fn change(
        &self,
        key: &ObjectKey,
        version: u64,
        value: &[u8],
        recipients: &[Uuid],
    ) -> ChangeMessage {
        let mut devices = vec![self.device_id()];
        devices.extend_from_slice(recipients);
        ChangeMessage {
            sender: self.device_id(),
            key: key.clone(),
            kind: ChangeKind::Upload,
            version,
            checksum: Some(checksum(value)),
            payloads: devices
                .into_iter()
                .map(|device_id| RecipientPayload {
                    device_id,
                    ciphertext: value.to_vec(),
                })
                .collect(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.writer, &frame).await.unwrap();
    }

    async fn next(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, read_frame(&mut self.reader, DEFAULT_MAX_FRAME_SIZE))
            .await
            .expect("server did not answer")
            .ok()
            .flatten()
    }

    async fn expect<M: WireMessage>(&mut self) -> M {
        let frame = self.next().await.expect("connection closed");
        assert!(
            frame.is::<M>(),
            "expected {}, got {}",
            M::TYPE_NAME,
            frame.message_type
        );
        frame.decode().unwrap()
    }

    async fn expect_closed(&mut self) {
        while let Some(frame) = self.next().await {
            assert!(
                frame.is::<DeviceList>(),
                "unexpected {} before close",
                frame.message_type
            );
        }
    }
}

#[tokio::test]
async fn registration_issues_ids() {
    let (addr, database) = start(ServerConfig::default()).await;
    let (client, pending) = RawClient::register(addr, identity(), None).await;

    assert!(pending.is_empty());
    let row = database.device(client.device_id()).unwrap().unwrap();
    assert_eq!(row.account_id, client.account_id());
    assert_eq!(database.account_count().unwrap(), 1);
}

#[tokio::test]
async fn same_key_reregisters_as_same_device() {
    let (addr, database) = start(ServerConfig::default()).await;
    let bytes = identity().to_bytes().unwrap();
    let registry = CryptoRegistry::default();

    let (first, _) =
        RawClient::register(addr, CryptoIdentity::from_bytes(&registry, &bytes).unwrap(), None)
            .await;
    drop(first.writer);
    let (second, _) =
        RawClient::register(addr, CryptoIdentity::from_bytes(&registry, &bytes).unwrap(), None)
            .await;

    assert_eq!(second.account, first.account);
    assert_eq!(database.device_count().unwrap(), 1);
}

#[tokio::test]
async fn bad_nonce_signature_closes_without_registering() {
    let (addr, database) = start(ServerConfig::default()).await;
    let (mut client, identify) = RawClient::connect(addr, identity()).await;

    let mut register = client.register_message(&identify, None);
    register.nonce_signature = identity().sign(&identify.nonce);
    client.send(Frame::new(&register).unwrap()).await;

    client.expect_closed().await;
    assert_eq!(database.device_count().unwrap(), 0);
}

#[tokio::test]
async fn unknown_account_is_rejected() {
    let (addr, database) = start(ServerConfig::default()).await;
    let (mut client, identify) = RawClient::connect(addr, identity()).await;

    let register = client.register_message(&identify, Some(Uuid::new_v4()));
    client.send(Frame::new(&register).unwrap()).await;

    client.expect_closed().await;
    assert_eq!(database.device_count().unwrap(), 0);
}

#[tokio::test]
async fn frames_before_registration_close_the_session() {
    let (addr, _) = start(ServerConfig::default()).await;
    let (mut client, _) = RawClient::connect(addr, identity()).await;

    let ack = DownloadAck {
        key: ObjectKey::new("Note", "1"),
        version: 1,
    };
    client.send(Frame::new(&ack).unwrap()).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn silent_connection_hits_the_deadline() {
    let config = ServerConfig::default().with_handshake_timeout(Duration::from_millis(200));
    let (addr, _) = start(config).await;
    let (mut client, _) = RawClient::connect(addr, identity()).await;

    client.expect_closed().await;
}

#[tokio::test]
async fn unsigned_change_closes_the_session() {
    let (addr, database) = start(ServerConfig::default()).await;
    let (mut client, _) = RawClient::register(addr, identity(), None).await;

    let key = ObjectKey::new("Note", "1");
    let change = client.change(&key, 1, b"v1", &[]);
    client.send(Frame::new(&change).unwrap()).await;

    client.expect_closed().await;
    assert!(database
        .index_entry(client.account_id(), &key)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn changes_are_relayed_and_acknowledged() {
    let (addr, database) = start(ServerConfig::default()).await;
    let (mut a, _) = RawClient::register(addr, identity(), None).await;
    let (mut b, pending) = RawClient::register(addr, identity(), Some(a.account_id())).await;
    assert!(pending.is_empty());
    // A learns about B.
    let list = a.expect::<DeviceList>().await;
    assert_eq!(list.devices.len(), 2);

    let key = ObjectKey::new("Note", "1");
    let frame = a.signed(&a.change(&key, 1, b"v1", &[b.device_id()]));
    a.send(frame.clone()).await;

    let ack = a.expect::<UploadAck>().await;
    assert_eq!((ack.key.clone(), ack.version), (key.clone(), 1));
    let download = b.expect::<Download>().await;
    assert_eq!(download.frame, frame);

    assert_eq!(database.pending_downloads(b.device_id()).unwrap().len(), 1);
    let ack = b.signed(&DownloadAck {
        key: key.clone(),
        version: 1,
    });
    b.send(ack).await;

    for _ in 0..50 {
        if database.pending_downloads(b.device_id()).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(database.pending_downloads(b.device_id()).unwrap().is_empty());
    let entry = database.index_entry(a.account_id(), &key).unwrap().unwrap();
    assert_eq!(entry.version, 1);
    assert!(!entry.changed);
}

#[tokio::test]
async fn stale_upload_gets_conflict() {
    let (addr, _) = start(ServerConfig::default()).await;
    let (mut a, _) = RawClient::register(addr, identity(), None).await;

    let key = ObjectKey::new("Note", "1");
    let newer = a.signed(&a.change(&key, 3, b"v3", &[]));
    a.send(newer.clone()).await;
    a.expect::<UploadAck>().await;

    let older = a.signed(&a.change(&key, 2, b"v2", &[]));
    a.send(older).await;
    let conflict = a.expect::<Conflict>().await;
    assert_eq!(conflict.version, 2);
    assert_eq!(conflict.server_version, 3);
    assert_eq!(conflict.current, Some(newer));
}

#[tokio::test]
async fn upload_sealed_for_stale_device_list_conflicts() {
    let (addr, _) = start(ServerConfig::default()).await;
    let (mut a, _) = RawClient::register(addr, identity(), None).await;
    let (_b, _) = RawClient::register(addr, identity(), Some(a.account_id())).await;
    a.expect::<DeviceList>().await;

    let key = ObjectKey::new("Note", "1");
    a.send(a.signed(&a.change(&key, 1, b"v1", &[]))).await;
    let conflict = a.expect::<Conflict>().await;
    assert_eq!(conflict.server_version, 1);
    assert_eq!(conflict.current, None);
}

#[tokio::test]
async fn offline_device_receives_queue_on_registration() {
    let (addr, _) = start(ServerConfig::default()).await;
    let (mut a, _) = RawClient::register(addr, identity(), None).await;
    let b_bytes = identity().to_bytes().unwrap();
    let registry = CryptoRegistry::default();

    let (b, _) = RawClient::register(
        addr,
        CryptoIdentity::from_bytes(&registry, &b_bytes).unwrap(),
        Some(a.account_id()),
    )
    .await;
    a.expect::<DeviceList>().await;
    let b_id = b.device_id();
    drop(b);

    let key = ObjectKey::new("Note", "1");
    a.send(a.signed(&a.change(&key, 1, b"v1", &[b_id]))).await;
    a.expect::<UploadAck>().await;

    let (_, pending) = RawClient::register(
        addr,
        CryptoIdentity::from_bytes(&registry, &b_bytes).unwrap(),
        Some(a.account_id()),
    )
    .await;
    assert_eq!(pending.len(), 1);
    let change: ChangeMessage = pending[0].frame.decode().unwrap();
    assert_eq!((change.key, change.version), (key, 1));
}
