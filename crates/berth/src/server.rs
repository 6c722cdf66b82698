//! The server supervisor.
//!
//! [`Server`] binds the listener, accepts TCP peers, builds one
//! [`Connection`] engine per peer through the host's
//! [`SessionFactory`](crate::SessionFactory), tracks the engines in a
//! registry, and drains every peer on [`stop`](Server::stop).
//!
//! The accept activity uses a bounded wait (500 ms) around `accept` so a stop
//! request is observed promptly; an elapsed wait is not an error, the loop
//! just re-checks the stop flag.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tracing::{debug, error, warn};

use crate::{
    Error, Result,
    close::DisconnectReason,
    connection::{Connection, ConnectionState},
    hooks::SessionFactory,
    options::ServerOptions,
    select::Target,
};

/// Close reason text sent to every peer during shutdown.
const SHUTDOWN_REASON: &str = "Server is shutting down";

/// How long one accept attempt may block before the stop flag is re-checked.
const ACCEPT_WAIT: Duration = Duration::from_millis(500);

/// A WebSocket server multiplexing many connection engines.
///
/// The handle is cheap to clone; all clones drive the same server.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use berth::{NoopHooks, Server, ServerOptions, SessionHooks, Target};
///
/// # async fn run() -> berth::Result<()> {
/// let options = ServerOptions::default().with_bind("127.0.0.1".parse().unwrap(), 9001);
/// let server = Server::new(options, |_addr: std::net::SocketAddr| -> Arc<dyn SessionHooks> {
///     Arc::new(NoopHooks)
/// });
///
/// server.start().await?;
/// server.queue_send_text(Target::Upgraded, "hello, everyone");
/// server.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    options: ServerOptions,
    factory: Arc<dyn SessionFactory>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<TcpListener>>,
    connections: HashMap<SocketAddr, Arc<Connection>>,
    tasks: HashMap<SocketAddr, JoinHandle<()>>,
}

impl Server {
    /// Creates a server with the given options and session factory.
    pub fn new(options: ServerOptions, factory: impl SessionFactory + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                factory: Arc::new(factory),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Binds the listener and starts accepting peers.
    ///
    /// Fails with [`Error::AlreadyRunning`] when the server is started twice
    /// without an intervening [`stop`](Server::stop).
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let bind = (self.shared.options.bind_address, self.shared.options.bind_port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "server listening");

        let accept_task = tokio::spawn(Self::accept_loop(self.clone(), listener));

        let mut inner = self.shared.inner.lock().expect("server registry poisoned");
        inner.local_addr = Some(local_addr);
        inner.accept_task = Some(accept_task);
        Ok(())
    }

    /// The bound address, once started. Resolves ephemeral-port binds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .inner
            .lock()
            .expect("server registry poisoned")
            .local_addr
    }

    /// Whether the server is currently accepting peers.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of registered connections, in any state.
    pub fn connection_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .expect("server registry poisoned")
            .connections
            .len()
    }

    /// Snapshot of the registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .inner
            .lock()
            .expect("server registry poisoned")
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Registers a connection and spawns the task driving its engine.
    ///
    /// Fails with [`Error::NotRunning`] when the server has not been started.
    pub fn accept_client(&self, conn: Arc<Connection>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }

        let addr = conn.addr();
        let server = self.clone();
        let driven = conn.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = driven.handle().await {
                error!(%addr, %err, "session hook failed");
            }
            // All three activities have observed Closed; only now is the
            // registry slot cleared.
            server.remove_client(addr);
        });

        let mut inner = self.shared.inner.lock().expect("server registry poisoned");
        inner.connections.insert(addr, conn);
        inner.tasks.insert(addr, task);
        debug!(%addr, "client registered");
        Ok(())
    }

    fn remove_client(&self, addr: SocketAddr) {
        let mut inner = self.shared.inner.lock().expect("server registry poisoned");
        if inner.connections.remove(&addr).is_some() {
            debug!(%addr, "client removed");
        }
        inner.tasks.remove(&addr);
    }

    /// Cleanly closes one connection.
    ///
    /// Fails with [`Error::NotInServer`] when the connection is not in this
    /// server's registry.
    pub async fn disconnect_client(
        &self,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        reason_text: &str,
    ) -> Result<()> {
        if !self.owns(conn) {
            return Err(Error::NotInServer);
        }
        conn.disconnect(reason, reason_text, None).await;
        Ok(())
    }

    /// Measures one connection's round trip; `-1` on timeout.
    ///
    /// Fails with [`Error::NotInServer`] when the connection is not in this
    /// server's registry.
    pub async fn ping_client(&self, conn: &Arc<Connection>, timeout_ms: u64) -> Result<i64> {
        if !self.owns(conn) {
            return Err(Error::NotInServer);
        }
        Ok(conn.ping(timeout_ms).await)
    }

    fn owns(&self, conn: &Arc<Connection>) -> bool {
        self.shared
            .inner
            .lock()
            .expect("server registry poisoned")
            .connections
            .get(&conn.addr())
            .is_some_and(|registered| Arc::ptr_eq(registered, conn))
    }

    /// Enqueues a text message on every connection the target names.
    ///
    /// Per-peer failures are not reported here; a peer that cannot be sent to
    /// shows up later through its own disconnect.
    pub fn queue_send_text(&self, target: Target, text: &str) {
        for conn in self.targets(target) {
            let _ = conn.queue_send_text(text);
        }
    }

    /// Enqueues a binary message on every connection the target names.
    pub fn queue_send_binary(&self, target: Target, data: &[u8]) {
        for conn in self.targets(target) {
            let _ = conn.queue_send_binary(data.to_vec());
        }
    }

    /// Resolves a target against a snapshot of the registry.
    fn targets(&self, target: Target) -> Vec<Arc<Connection>> {
        let inner = self.shared.inner.lock().expect("server registry poisoned");
        match target {
            Target::All => inner.connections.values().cloned().collect(),
            Target::Upgraded => inner
                .connections
                .values()
                .filter(|conn| conn.state() == ConnectionState::Upgraded)
                .cloned()
                .collect(),
            Target::Single(addr) => inner.connections.get(&addr).cloned().into_iter().collect(),
        }
    }

    /// Stops the server: ends the accept activity, disconnects every peer
    /// with [`DisconnectReason::ServerShutdown`], waits for all engines to
    /// finish, and releases the listener. Calling `stop` on a stopped server
    /// is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        debug!("server stopping");
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let accept_task = self
            .shared
            .inner
            .lock()
            .expect("server registry poisoned")
            .accept_task
            .take();
        let listener = match accept_task {
            Some(task) => task.await.ok(),
            None => None,
        };

        for conn in self.connections() {
            conn.disconnect(DisconnectReason::ServerShutdown, SHUTDOWN_REASON, None)
                .await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut inner = self.shared.inner.lock().expect("server registry poisoned");
            inner.tasks.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        {
            let mut inner = self.shared.inner.lock().expect("server registry poisoned");
            inner.connections.clear();
            inner.local_addr = None;
        }

        self.shared.running.store(false, Ordering::SeqCst);
        drop(listener);
        debug!("server stopped");
        Ok(())
    }

    /// Accept activity. Returns the listener so `stop` controls when it is
    /// released.
    async fn accept_loop(server: Server, listener: TcpListener) -> TcpListener {
        while !server.shared.stop_requested.load(Ordering::SeqCst) {
            let accepted = match timeout(ACCEPT_WAIT, listener.accept()).await {
                // Bounded wait elapsed; go around and re-check the stop flag.
                Err(_) => continue,
                Ok(Err(err)) => {
                    warn!(%err, "accept failed");
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let (stream, addr) = accepted;
            debug!(%addr, "client connected");

            let hooks = server.shared.factory.create(addr);
            let conn = Connection::new(stream, addr, server.shared.options.clone(), hooks);
            if let Err(err) = server.accept_client(conn) {
                warn!(%addr, %err, "client could not be registered");
            }
        }
        listener
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
