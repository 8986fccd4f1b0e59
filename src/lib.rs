//! NVDA Remote relay server library
//!
//! A small TLS relay implementing the wire protocol used by the NVDA
//! screen reader's remote-access feature. Clients connect over TLS, present
//! a channel name (optionally minted by the server) plus a role, and the
//! server fans line-delimited JSON messages out to every channel member
//! whose role differs from the sender's.
//!
//! # Features
//! - Line-delimited JSON handshake: `protocol_version`, `generate_key`, `join`
//! - Role-asymmetric fan-out between `master` and `slave` peers
//! - Ephemeral channels, created on first join and destroyed on last leave
//! - 8-digit channel key minting
//! - Optional `origin` stamping of relayed messages
//! - Message of the day on join
//! - Self-signed certificate generation
//!
//! # Architecture
//! One accept task, two tasks per connection:
//! - the reader drives the handshake state machine and the relay dispatch
//! - the write pump drains a bounded queue under a per-write deadline
//!
//! Shared channel state lives in the [`registry::Registry`] behind one
//! read/write lock; fan-out takes the read lock, joins and leaves the write
//! lock. Teardown of either connection task closes the client exactly once.
//!
//! # Example
//! ```ignore
//! use std::path::Path;
//! use remote_relay::{tls, RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), remote_relay::RelayError> {
//!     let tls = tls::load(Path::new("server.pem"))?;
//!     let server = RelayServer::new(RelayConfig::default(), Some(tls));
//!     server.start("0.0.0.0:6837").await
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod tls;
pub mod types;
pub mod writer;

// Re-export main types for convenience
pub use client::Client;
pub use config::RelayConfig;
pub use error::RelayError;
pub use listener::KeepAliveListener;
pub use message::{HandshakeMessage, Msg, ServerMessage};
pub use registry::Registry;
pub use server::RelayServer;
pub use types::ClientId;
