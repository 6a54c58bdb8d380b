//! TCP listener and session supervision.

use crate::config::ServerConfig;
use crate::database::DatabaseController;
use crate::error::{ServerError, ServerResult};
use crate::hub::SessionHub;
use crate::session::{self, SessionContext};
use datasync_storage::KeyValueBackend;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Relay server accepting device connections.
///
/// ```rust,ignore
/// let backend = Arc::new(FileBackend::open_with_create_dirs("server.log")?);
/// let server = SyncServer::bind(ServerConfig::default(), backend).await?;
/// server.serve_until(tokio::signal::ctrl_c().map(|_| ())).await?;
/// ```
pub struct SyncServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    next_session: AtomicU64,
}

impl SyncServer {
    /// Opens the database and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if no signature algorithm is enabled, the database
    /// cannot be opened, or the address cannot be bound.
    pub async fn bind(config: ServerConfig, backend: Arc<dyn KeyValueBackend>) -> ServerResult<Self> {
        let sign_scheme = config
            .registry
            .preferred_sign_scheme()
            .ok_or_else(|| ServerError::Internal("no signature algorithm enabled".into()))?;
        let database = Arc::new(DatabaseController::open(backend)?);
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            devices = database.device_count()?,
            accounts = database.account_count()?,
            workers = config.max_workers,
            "relay server listening"
        );

        let workers = Arc::new(Semaphore::new(config.max_workers));
        Ok(Self {
            listener,
            ctx: Arc::new(SessionContext {
                config,
                database,
                hub: Arc::new(SessionHub::new()),
                workers,
                sign_scheme,
            }),
            next_session: AtomicU64::new(1),
        })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The server's database.
    pub fn database(&self) -> &Arc<DatabaseController> {
        &self.ctx.database
    }

    /// Registry of connected devices.
    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.ctx.hub
    }

    /// Serves connections until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and retried.
    pub async fn run(self) -> ServerResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves, then stops every
    /// session.
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and retried.
    pub async fn serve_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                        sessions.spawn(session::serve(Arc::clone(&self.ctx), stream, peer, id));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(sessions = sessions.len(), "relay server stopping");
        sessions.shutdown().await;
        Ok(())
    }
}
