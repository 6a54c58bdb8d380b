//! Server configuration.

use datasync_crypto::CryptoRegistry;
use datasync_protocol::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum number of frames processed concurrently across all sessions.
    pub max_workers: usize,
    /// Deadline for a connection to complete registration.
    pub handshake_timeout: Duration,
    /// Interval at which a closing session checks for running frame tasks.
    pub teardown_poll: Duration,
    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
    /// Accepted signature and encryption algorithms. The first signature
    /// scheme is announced in `Identify`.
    pub registry: CryptoRegistry,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_workers: 64,
            handshake_timeout: Duration::from_secs(30),
            teardown_poll: Duration::from_millis(500),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            registry: CryptoRegistry::default(),
        }
    }

    /// Sets the worker limit.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Sets the registration deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the teardown polling interval.
    pub fn with_teardown_poll(mut self, interval: Duration) -> Self {
        self.teardown_poll = interval;
        self
    }

    /// Sets the maximum frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the accepted algorithms.
    pub fn with_registry(mut self, registry: CryptoRegistry) -> Self {
        self.registry = registry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 4242)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4242);
        assert_eq!(config.max_workers, 64);
        assert_eq!(config.teardown_poll, Duration::from_millis(500));
        assert!(config.registry.preferred_sign_scheme().is_some());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_workers(0)
            .with_handshake_timeout(Duration::from_secs(2))
            .with_max_frame_size(1024);

        assert_eq!(config.max_workers, 1);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.max_frame_size, 1024);
    }
}
