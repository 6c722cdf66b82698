//! # berth
//!
//! An embeddable WebSocket (RFC 6455) server engine.
//!
//! berth terminates raw TCP, performs the HTTP upgrade handshake, exchanges
//! framed text and binary messages, answers the control-frame sub-protocol
//! (close, ping, pong), optionally keeps connections alive with measured
//! pings, and tells the host about everything through a hook trait. It is
//! built to be owned by a host process — a game server, a custom backend —
//! rather than to stand alone: there is no CLI, no configuration loading, no
//! TLS (front it with a terminator if you need one).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Server (supervisor)                           │
//! │ • accept loop with bounded waits              │
//! │ • registry of connections + driver tasks      │
//! │ • broadcast by Target, cooperative shutdown   │
//! └───────────────┬───────────────────────────────┘
//!                 │ one per peer
//! ┌───────────────▼───────────────────────────────┐
//! │ Connection (engine)                           │
//! │ • reader: handshake, frame decode, dispatch   │
//! │ • writer: FIFO drain, fragmentation           │
//! │ • pinger: keep-alive round trips              │
//! └───────────────┬───────────────────────────────┘
//!                 │
//! ┌───────────────▼───────────────────────────────┐
//! │ codec / frame / mask                          │
//! │ • RFC 6455 wire format                        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use berth::{Connection, Result, Server, ServerOptions, SessionHooks};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl SessionHooks for Echo {
//!     async fn on_message(&self, conn: &Arc<Connection>, text: &str) -> Result<()> {
//!         conn.queue_send_text(text)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = ServerOptions::default()
//!         .with_bind("127.0.0.1".parse().unwrap(), 9001)
//!         .with_auto_ping(10, 5);
//!     let server = Server::new(options, |_addr: std::net::SocketAddr| -> Arc<dyn SessionHooks> {
//!         Arc::new(Echo)
//!     });
//!
//!     server.start().await?;
//!     // ... run until told otherwise ...
//!     server.stop().await
//! }
//! ```
//!
//! # Protocol posture
//!
//! - Server frames are never masked; unmasked client frames close the
//!   connection with a 1002.
//! - A data frame with FIN=0 is treated as a protocol violation; fragmented
//!   client messages are not reassembled.
//! - Pings from the peer are answered with pongs automatically.
//! - Outgoing messages larger than the per-frame bound are split into a head
//!   frame plus continuations.

pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
#[doc(hidden)]
pub mod mask;
pub mod options;
pub mod select;

mod connection;
mod hooks;
mod server;

use thiserror::Error as ThisError;

pub use crate::{
    close::{CloseCode, DisconnectReason, ErrorKind},
    codec::{Decoder, Encoder, Role},
    connection::{Connection, ConnectionState},
    frame::{Frame, OpCode},
    hooks::{NoopHooks, SessionFactory, SessionHooks},
    options::{AutoPing, Messaging, ServerOptions},
    select::Target,
    server::Server,
};

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine and the supervisor.
///
/// Protocol failures on a live connection do not surface through `Result`s;
/// they close the connection and arrive at
/// [`SessionHooks::on_disconnected`]. The variants here are either
/// transport/codec errors carried into that hook, or the eager
/// precondition-misuse family (`NotConnected`, `AlreadyConnected`,
/// `NotInServer`, `AlreadyRunning`, `NotRunning`).
#[derive(ThisError, Debug)]
pub enum Error {
    /// I/O error on the listener or a stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An operation was used in a way the protocol state forbids.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A message exceeded a configured maximum.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// A session hook failed.
    #[error("session hook: {0}")]
    Hook(#[from] anyhow::Error),

    /// The connection is not upgraded (or already closed).
    #[error("client is not connected")]
    NotConnected,

    /// `handle` was invoked twice on one connection.
    #[error("client is already connected")]
    AlreadyConnected,

    /// The connection does not belong to this server.
    #[error("client is not registered with this server")]
    NotInServer,

    /// `start` was invoked on a running server.
    #[error("server is already running")]
    AlreadyRunning,

    /// The server is not running.
    #[error("server is not running")]
    NotRunning,
}
