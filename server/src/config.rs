//! Host configuration with defaults tuned for a local-network party game.

use shared::frame::DEFAULT_MAX_PAYLOAD;
use std::path::PathBuf;
use std::time::Duration;

/// Actions a single session may dispatch per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_actions: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_actions: 60,
            window: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// Only upgrade requests for this path are accepted.
    pub path: String,
    /// How long a disconnected player keeps their seat.
    pub grace_period: Duration,
    /// Trailing-edge debounce for state pushes (~30 Hz).
    pub broadcast_interval: Duration,
    pub rate_limit: RateLimit,
    pub max_payload: usize,
    /// How often expired grace periods are swept.
    pub sweep_interval: Duration,
    /// How long a host-initiated close waits for the peer's echo.
    pub close_timeout: Duration,
    /// A client must finish the opening handshake within this time.
    pub handshake_timeout: Duration,
    /// Frames queued per connection before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// When set, every applied action is recorded and written here on shutdown.
    pub record_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            path: "/ws".to_string(),
            grace_period: Duration::from_secs(30),
            broadcast_interval: Duration::from_millis(33),
            rate_limit: RateLimit::default(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            sweep_interval: Duration::from_millis(250),
            close_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            outbound_capacity: 256,
            record_path: None,
        }
    }
}
