//! Host integration points.
//!
//! A host embeds the server by implementing [`SessionHooks`] for its
//! per-connection behavior and handing the supervisor a [`SessionFactory`]
//! that builds one hook object per accepted peer.
//!
//! Hooks run on the owning connection's activities: a hook that blocks stalls
//! that connection (and only that connection). The data hooks return
//! `Result` so a failing host can abort the connection — an error closes it
//! with a 1011 and still fires [`SessionHooks::on_disconnected`], which is
//! the single place disconnects of any cause are reported.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;

use crate::{Result, close::DisconnectReason, connection::Connection};

/// Per-connection event hooks.
///
/// Every method has a default no-op implementation; implement the ones the
/// host cares about. Invocation order on a connection is fixed:
/// `on_connected`, then `on_upgraded`, then any number of
/// `on_message`/`on_data`, then `on_disconnected` exactly once.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// A TCP peer was accepted and its engine is starting.
    async fn on_connected(&self, conn: &Arc<Connection>) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// The opening handshake completed; the connection can now exchange
    /// frames.
    async fn on_upgraded(&self, conn: &Arc<Connection>) -> Result<()> {
        let _ = conn;
        Ok(())
    }

    /// A complete text message arrived.
    async fn on_message(&self, conn: &Arc<Connection>, text: &str) -> Result<()> {
        let _ = (conn, text);
        Ok(())
    }

    /// A complete binary message arrived.
    async fn on_data(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<()> {
        let _ = (conn, data);
        Ok(())
    }

    /// The connection reached its terminal state.
    ///
    /// `error` carries the underlying failure when the close was caused by
    /// one.
    async fn on_disconnected(
        &self,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        error: Option<&crate::Error>,
    ) {
        let _ = (conn, reason, error);
    }

    /// Decides whether an upgrade request is acceptable.
    ///
    /// `headers` is the parsed case-sensitive header map and `request` the
    /// raw request text. Returning `false` rejects the handshake and closes
    /// the connection with a protocol-error code.
    fn verify_handshake(&self, headers: &HashMap<String, String>, request: &str) -> bool {
        let _ = (headers, request);
        true
    }
}

/// Builds the [`SessionHooks`] instance for each accepted peer.
pub trait SessionFactory: Send + Sync {
    fn create(&self, addr: SocketAddr) -> Arc<dyn SessionHooks>;
}

/// Any `Fn(SocketAddr) -> Arc<dyn SessionHooks>` closure is a factory.
impl<F> SessionFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn SessionHooks> + Send + Sync,
{
    fn create(&self, addr: SocketAddr) -> Arc<dyn SessionHooks> {
        self(addr)
    }
}

/// Hooks that do nothing; useful for tests and for hosts that only push data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {}
