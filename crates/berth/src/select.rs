//! Broadcast targets.

use std::net::SocketAddr;

/// Names the set of connections a server-level send addresses.
///
/// Selection is evaluated against a snapshot of the registry at call time, so
/// connections arriving or leaving during a broadcast never affect the
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every registered connection, regardless of state.
    All,
    /// Connections that completed the handshake; only these can receive
    /// data frames.
    Upgraded,
    /// Exactly one connection, named by its peer address.
    Single(SocketAddr),
}
