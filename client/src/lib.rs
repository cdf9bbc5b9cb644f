//! # Session Probe Client
//!
//! A small headless client for the session host. It performs the opening
//! handshake, joins with a secret, keeps a clock offset against the host and
//! logs every state push it receives. Useful for load checks and for poking
//! at a running host from a terminal.
//!
//! ## Identity
//!
//! The host derives a player's identity from the secret sent in `JOIN`.
//! Reusing the same secret after a disconnect resumes the same seat, as long
//! as the host's grace period has not run out. [`generate_secret`] produces a
//! fresh one; print it and pass it back with `--secret` to test reconnects.
//!
//! ## Module Organization
//!
//! - `network`: upgraded connection, masked frames, the probe loop
//! - `tracker`: the client's copy of the session and its clock samples
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use client::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         name: "ada".to_string(),
//!         ..ClientConfig::default()
//!     };
//!     Client::new(config).run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod tracker;

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

pub const SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub path: String,
    pub name: String,
    pub avatar: Option<String>,
    pub secret: String,
    pub ping_interval: Duration,
    /// Send a random scoring action this often; `None` keeps the client passive.
    pub action_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            path: "/ws".to_string(),
            name: "player".to_string(),
            avatar: None,
            secret: generate_secret(),
            ping_interval: Duration::from_secs(2),
            action_interval: None,
        }
    }
}

/// Random alphanumeric secret, long enough for the host's minimum.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
