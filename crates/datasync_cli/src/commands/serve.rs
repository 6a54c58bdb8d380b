//! Serve command implementation.

use datasync_server::{ServerConfig, SyncServer};
use datasync_storage::FileBackend;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Runs the relay server until Ctrl-C.
pub fn run(
    path: &Path,
    bind: SocketAddr,
    workers: usize,
    handshake_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(FileBackend::open_with_create_dirs(path)?.with_sync_on_write(true));
    let config = ServerConfig::new(bind)
        .with_max_workers(workers)
        .with_handshake_timeout(Duration::from_secs(handshake_timeout));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let server = SyncServer::bind(config, backend).await?;
        server
            .serve_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    })?;

    info!(path = %path.display(), "relay server stopped");
    Ok(())
}
