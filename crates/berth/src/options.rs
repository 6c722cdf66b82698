//! Server configuration.

use std::net::{IpAddr, Ipv4Addr};

/// Configuration for a [`Server`](crate::Server) and the connections it
/// accepts.
///
/// The record is plain data with consuming `with_*` setters:
///
/// ```rust
/// use berth::ServerOptions;
///
/// let options = ServerOptions::default()
///     .with_bind("127.0.0.1".parse().unwrap(), 9001)
///     .with_auto_ping(10, 5)
///     .with_disconnect_phrase("bye");
/// ```
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address the listener binds to.
    ///
    /// Default: `127.0.0.1`
    pub bind_address: IpAddr,

    /// Port the listener binds to. Port 0 requests an ephemeral port; the
    /// resolved address is available from
    /// [`Server::local_addr`](crate::Server::local_addr).
    ///
    /// Default: `8080`
    pub bind_port: u16,

    /// A text payload whose receipt triggers a clean close of the sending
    /// connection.
    ///
    /// Default: `"disconnect"`
    pub disconnect_phrase: String,

    /// Keep-alive pinging.
    pub auto_ping: AutoPing,

    /// Message size bounds.
    pub messaging: Messaging,
}

/// Keep-alive ping configuration.
#[derive(Debug, Clone, Copy)]
pub struct AutoPing {
    /// Whether each connection runs a pinger.
    ///
    /// Default: `false`
    pub enabled: bool,

    /// Seconds between pings.
    ///
    /// Default: `10`
    pub interval_secs: u64,

    /// Seconds to wait for the matching pong before the connection is
    /// considered dead.
    ///
    /// Default: `5`
    pub timeout_secs: u64,
}

/// Message size bounds.
#[derive(Debug, Clone, Copy)]
pub struct Messaging {
    /// Maximum bytes buffered for an incoming message before the connection
    /// is closed with a 1009.
    ///
    /// Default: `32768`
    pub max_message_receive_bytes: usize,

    /// Maximum on-wire bytes for one outgoing message, frame headers
    /// included.
    ///
    /// Default: `65535`
    pub max_message_send_bytes: usize,

    /// Maximum bytes per outgoing frame; larger messages are split into a
    /// head frame plus continuations.
    ///
    /// Default: `16384`
    pub max_frame_send_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 8080,
            disconnect_phrase: "disconnect".to_string(),
            auto_ping: AutoPing::default(),
            messaging: Messaging::default(),
        }
    }
}

impl Default for AutoPing {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

impl Default for Messaging {
    fn default() -> Self {
        Self {
            max_message_receive_bytes: 32768,
            max_message_send_bytes: 65535,
            max_frame_send_bytes: 16384,
        }
    }
}

impl ServerOptions {
    /// Sets the bind address and port.
    pub fn with_bind(self, address: IpAddr, port: u16) -> Self {
        Self {
            bind_address: address,
            bind_port: port,
            ..self
        }
    }

    /// Sets the disconnect phrase.
    pub fn with_disconnect_phrase(self, phrase: impl Into<String>) -> Self {
        Self {
            disconnect_phrase: phrase.into(),
            ..self
        }
    }

    /// Enables keep-alive pinging with the given interval and timeout, both
    /// in seconds.
    pub fn with_auto_ping(mut self, interval_secs: u64, timeout_secs: u64) -> Self {
        self.auto_ping = AutoPing {
            enabled: true,
            interval_secs,
            timeout_secs,
        };
        self
    }

    /// Sets the incoming message size bound.
    pub fn with_max_receive_bytes(mut self, max: usize) -> Self {
        self.messaging.max_message_receive_bytes = max;
        self
    }

    /// Sets the outgoing message and per-frame size bounds.
    pub fn with_send_limits(mut self, max_message: usize, max_frame: usize) -> Self {
        self.messaging.max_message_send_bytes = max_message;
        self.messaging.max_frame_send_bytes = max_frame;
        self
    }
}
