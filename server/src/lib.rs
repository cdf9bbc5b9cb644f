//! # Session Host Library
//!
//! This library provides the authoritative host for a local-network real-time
//! session. It owns the canonical application state, accepts untrusted socket
//! connections, and keeps every connected party's view of that state
//! consistent across disconnects, reconnects and duplicate sessions.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! Clients never edit state directly. They send actions; the host runs each
//! one through a middleware chain and a pure reducer, and the result replaces
//! the canonical state as a new immutable snapshot.
//!
//! ### Session Management
//! Handles the complete lifecycle of a connection:
//! - Opening handshake and path scoping
//! - Join with an opaque secret and deterministic player identity
//! - Reconnection within a grace period, and removal after it
//! - Duplicate sessions, where the newest connection wins
//! - Per-session rate limiting
//!
//! ### State Broadcasting
//! State pushes are debounced on the trailing edge. A burst of actions yields
//! one `STATE_UPDATE` carrying the final state plus every action that led to
//! it, in dispatch order.
//!
//! ## Architecture Design
//!
//! ### Single Engine Task
//! One task owns the session registry, the pipeline and the broadcast
//! scheduler. Connection tasks talk to it only through typed events on an
//! unbounded channel, so there are no locks on the dispatch path.
//!
//! ### Per-Connection Tasks
//! Every socket gets a reader task (framing, parsing, ping replies) and a
//! writer task fed by its own bounded queue. A socket whose queue fills up
//! is dropped, so a slow peer cannot stall the engine or any other
//! connection.
//!
//! ## Module Organization
//!
//! - `session`: connection and identity bookkeeping, grace periods, rate limits
//! - `identity`: secret validation and player id derivation
//! - `pipeline`: root reducer, middleware composition and dispatch
//! - `middleware`: middleware trait plus logging and schema validation
//! - `broadcast`: trailing-edge debounce for state pushes
//! - `time_sync`: clock probe replies
//! - `engine`: the event loop tying the above together
//! - `network`: TCP listener and connection tasks
//! - `game`: a small demo application used by the `server` binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "0.0.0.0:8080".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     // Clients connect to ws://<host>:8080/ws
//!     let server = Server::bind(config, game::build_pipeline()).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod game;
pub mod identity;
pub mod middleware;
pub mod network;
pub mod pipeline;
pub mod session;
pub mod time_sync;
