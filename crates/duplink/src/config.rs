//! Endpoint and per-link configuration.

use std::time::Duration;

/// Per-connection timing and transport limits, shared by both roles.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Keepalive ping period. A peer that leaves a ping unanswered for a
    /// full period is considered dead.
    pub ping_interval: Duration,
    /// How long the handshake may take before the connection is closed
    /// with a protocol error.
    pub auth_timeout: Duration,
    /// Ask the peer for application-level `pong` messages. Only needed by
    /// transports that cannot observe WebSocket pong frames.
    pub request_pong_messages: bool,
    /// Maximum accepted WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(1000),
            auth_timeout: Duration::from_secs(5),
            request_pong_messages: false,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Server endpoint configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Per-connection settings.
    pub link: LinkConfig,
    /// Accepts beyond this many open connections are dropped.
    pub max_conns: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            max_conns: 1024,
        }
    }
}

/// Client endpoint configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL to dial, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// Per-connection settings.
    pub link: LinkConfig,
    /// Reconnect policy for lost connections.
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Configuration for the given URL with default timing and reconnect
    /// policy.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            link: LinkConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Automatic reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to dial again after a lost connection.
    pub enabled: bool,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}
