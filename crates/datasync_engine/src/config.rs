//! Configuration for the sync engine.

use datasync_crypto::{CryptAlgorithm, SignAlgorithm};
use datasync_protocol::KeyScheme;
use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Configuration of one sync setup (one local store synced with one account).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the setup, used in logs and fatal-error reports.
    pub setup_name: String,
    /// Relay server address (`host:port`).
    pub remote_addr: String,
    /// Name announced for this device.
    pub device_name: String,
    /// Account to join on first registration; `None` creates a new account.
    pub account: Option<Uuid>,
    /// Signature scheme for a newly generated identity.
    pub sign_scheme: KeyScheme,
    /// Encryption scheme for a newly generated identity.
    pub crypt_scheme: KeyScheme,
    /// Deadline for connecting and completing registration.
    pub handshake_timeout: Duration,
    /// Maximum accepted frame size.
    pub max_frame_size: usize,
    /// Reconnect backoff.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(setup_name: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            setup_name: setup_name.into(),
            remote_addr: remote_addr.into(),
            device_name: default_device_name(),
            account: None,
            sign_scheme: SignAlgorithm::Ed25519.scheme(),
            crypt_scheme: CryptAlgorithm::X25519XSalsa20Poly1305.scheme(),
            handshake_timeout: Duration::from_secs(30),
            max_frame_size: datasync_protocol::DEFAULT_MAX_FRAME_SIZE,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Joins an existing account instead of creating one.
    pub fn with_account(mut self, account: Uuid) -> Self {
        self.account = Some(account);
        self
    }

    /// Sets the signature scheme for a new identity.
    pub fn with_sign_scheme(mut self, scheme: KeyScheme) -> Self {
        self.sign_scheme = scheme;
        self
    }

    /// Sets the encryption scheme for a new identity.
    pub fn with_crypt_scheme(mut self, scheme: KeyScheme) -> Self {
        self.crypt_scheme = scheme;
        self
    }

    /// Sets the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the maximum accepted frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default", "127.0.0.1:4242")
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "datasync-device".to_string())
}

/// Reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a backoff starting at `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
