//! The per-connection protocol engine.
//!
//! A [`Connection`] owns one TCP peer from accept to teardown. Its
//! [`handle`](Connection::handle) call runs three cooperating activities to
//! completion over the single stream:
//!
//! - the **reader** drives the HTTP upgrade and then decodes client frames,
//!   dispatching data to the session hooks and handling control frames;
//! - the **writer** drains the outbound FIFO, splitting each message into
//!   frames within the configured bounds;
//! - the **pinger** (when keep-alive is enabled) measures round trips and
//!   tears the connection down when the peer stops answering.
//!
//! The stream is read only by the reader; writes are serialized through a
//! lock held for the whole of a message, which both keeps multi-frame
//! messages contiguous on the wire and lets [`disconnect`](Connection::disconnect)
//! wait for in-flight work to drain before it emits the Close frame.
//!
//! State moves strictly forward: `Accepted` → `Upgraded` → `Closing` →
//! `Closed`. A closed connection is never reused.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, Notify, mpsc},
    time::{sleep, sleep_until},
};
use tokio_util::{
    codec::{Decoder as _, Encoder as _},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    Error, Result,
    close::{DisconnectReason, ErrorKind},
    codec::{Decoder, Encoder, Role},
    frame::{Frame, OpCode},
    handshake,
    hooks::SessionHooks,
    options::ServerOptions,
};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP accepted, handshake not yet complete.
    Accepted = 0,
    /// Handshake reply written; frames are being exchanged.
    Upgraded = 1,
    /// Teardown in progress.
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::Upgraded,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Upgraded => "upgraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Write side of the stream plus its encoder and scratch buffer.
///
/// Locked for the duration of a whole message so frames of one message are
/// never interleaved with another's.
struct WriteEnd {
    stream: OwnedWriteHalf,
    encoder: Encoder,
    buf: BytesMut,
}

impl WriteEnd {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.buf.clear();
        self.encoder.encode(frame, &mut self.buf)?;
        self.stream.write_all(&self.buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// One accepted TCP peer and its protocol engine.
pub struct Connection {
    addr: SocketAddr,
    options: ServerOptions,
    hooks: Arc<dyn SessionHooks>,
    state: AtomicU8,
    started: AtomicBool,
    disconnecting: AtomicBool,
    disconnected_fired: AtomicBool,
    ponged: AtomicBool,
    ping_millis: AtomicI64,
    pong_signal: Notify,
    shutdown: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<(OpCode, Bytes)>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(OpCode, Bytes)>>>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_end: Mutex<WriteEnd>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        addr: SocketAddr,
        options: ServerOptions,
        hooks: Arc<dyn SessionHooks>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            addr,
            options,
            hooks,
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            started: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            ponged: AtomicBool::new(false),
            ping_millis: AtomicI64::new(0),
            pong_signal: Notify::new(),
            shutdown: CancellationToken::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            read_half: Mutex::new(Some(read_half)),
            write_end: Mutex::new(WriteEnd {
                stream: write_half,
                encoder: Encoder::new(Role::Server),
                buf: BytesMut::new(),
            }),
        })
    }

    /// The peer's address; doubles as the connection's stable identity.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Last measured round trip in whole milliseconds, `-1` after a ping
    /// timed out.
    pub fn ping_millis(&self) -> i64 {
        self.ping_millis.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Runs the engine to completion.
    ///
    /// Starts the reader, writer, and (when enabled) pinger activities and
    /// returns once all of them have terminated, which only happens after the
    /// connection reached [`ConnectionState::Closed`]. May be invoked once;
    /// a second call fails with [`Error::AlreadyConnected`].
    ///
    /// A hook failure during frame handling closes the connection with a
    /// 1011 and is returned to the caller after teardown.
    pub async fn handle(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }

        debug!(addr = %self.addr, "connection engine starting");

        if let Err(err) = self.hooks.on_connected(self).await {
            self.close_with(ErrorKind::HandlingException, None).await;
            return Err(err);
        }

        let read_half = self
            .read_half
            .lock()
            .await
            .take()
            .expect("bug: read half taken before handle");
        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("bug: outbound queue taken before handle");

        let (read_result, _, _) = tokio::join!(
            self.read_loop(read_half),
            self.write_loop(outbound_rx),
            self.ping_loop(),
        );

        debug!(addr = %self.addr, "connection engine finished");
        read_result
    }

    /// Enqueues a text message for the writer.
    ///
    /// Fails with [`Error::NotConnected`] unless the connection is upgraded
    /// (or draining toward close). Messages from one caller reach the wire in
    /// enqueue order.
    pub fn queue_send_text(&self, text: impl Into<String>) -> Result<()> {
        self.queue_send(OpCode::Text, Bytes::from(text.into().into_bytes()))
    }

    /// Enqueues a binary message for the writer.
    pub fn queue_send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.queue_send(OpCode::Binary, data.into())
    }

    fn queue_send(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        if !matches!(
            self.state(),
            ConnectionState::Upgraded | ConnectionState::Closing
        ) {
            return Err(Error::NotConnected);
        }
        self.outbound_tx
            .send((opcode, payload))
            .map_err(|_| Error::NotConnected)
    }

    /// Sends a Ping and waits up to `timeout_ms` for the peer's Pong.
    ///
    /// Returns the measured round trip in whole milliseconds, or `-1` when
    /// the timeout elapses or the connection starts closing first. The Ping
    /// frame itself is never cancelled; a late Pong simply satisfies the next
    /// call.
    pub async fn ping(&self, timeout_ms: u64) -> i64 {
        if self.state() != ConnectionState::Upgraded || self.is_disconnecting() {
            return -1;
        }

        self.ponged.store(false, Ordering::SeqCst);
        let started = Instant::now();
        if self.outbound_tx.send((OpCode::Ping, Bytes::new())).is_err() {
            return -1;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.ponged.load(Ordering::SeqCst) {
                let measured = started.elapsed().as_millis() as i64;
                self.ping_millis.store(measured, Ordering::SeqCst);
                return measured;
            }
            if self.is_disconnecting() {
                self.ping_millis.store(-1, Ordering::SeqCst);
                return -1;
            }

            tokio::select! {
                _ = self.pong_signal.notified() => {}
                _ = self.shutdown.cancelled() => {
                    self.ping_millis.store(-1, Ordering::SeqCst);
                    return -1;
                }
                _ = sleep_until(deadline) => {
                    self.ping_millis.store(-1, Ordering::SeqCst);
                    return -1;
                }
            }
        }
    }

    /// Closes the connection.
    ///
    /// Freezes new sends, waits for the writer's in-flight message to drain,
    /// writes a single Close frame carrying the mapped close code and
    /// `reason_text`, shuts the stream down, and fires
    /// [`SessionHooks::on_disconnected`] exactly once. A second call is a
    /// no-op.
    pub async fn disconnect(
        self: &Arc<Self>,
        reason: DisconnectReason,
        reason_text: &str,
        error: Option<Error>,
    ) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();

        // Locking the write end waits out whatever message the writer is
        // currently sending.
        let mut write_end = self.write_end.lock().await;
        let close = Frame::close(reason.close_code(), reason_text);
        if let Err(err) = write_end.send(close).await {
            debug!(addr = %self.addr, %err, "close frame could not be written");
        }
        let _ = write_end.stream.shutdown().await;
        drop(write_end);

        self.set_state(ConnectionState::Closed);
        debug!(addr = %self.addr, %reason, "connection closed");

        if !self.disconnected_fired.swap(true, Ordering::SeqCst) {
            self.hooks
                .on_disconnected(self, reason, error.as_ref())
                .await;
        }
    }

    async fn close_with(self: &Arc<Self>, kind: ErrorKind, error: Option<Error>) {
        self.disconnect(DisconnectReason::Error(kind), "", error)
            .await;
    }

    /// Reader activity: upgrade handshake, then frame decode and dispatch.
    async fn read_loop(self: &Arc<Self>, mut stream: OwnedReadHalf) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut decoder = Decoder::new(self.options.messaging.max_message_receive_bytes);

        loop {
            if self.is_disconnecting()
                || !matches!(
                    self.state(),
                    ConnectionState::Accepted | ConnectionState::Upgraded
                )
            {
                return Ok(());
            }

            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                read = stream.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    self.close_with(ErrorKind::StreamDisposed, None).await;
                    return Ok(());
                }
                Err(err) => {
                    self.close_with(ErrorKind::StreamDisposed, Some(err.into()))
                        .await;
                    return Ok(());
                }
                Ok(_) => {}
            }

            let limit = self.options.messaging.max_message_receive_bytes;
            if buf.len() > limit {
                self.close_with(
                    ErrorKind::MessageTooLarge,
                    Some(Error::MessageTooLarge {
                        size: buf.len(),
                        limit,
                    }),
                )
                .await;
                return Ok(());
            }

            match self.state() {
                ConnectionState::Accepted => {
                    self.process_upgrade(&mut buf).await?;
                    // Frames that rode in on the same segment as the request.
                    if self.state() == ConnectionState::Upgraded && !buf.is_empty() {
                        self.drain_frames(&mut decoder, &mut buf).await?;
                    }
                }
                ConnectionState::Upgraded => self.drain_frames(&mut decoder, &mut buf).await?,
                _ => return Ok(()),
            }
        }
    }

    /// Treats the buffered bytes as the HTTP upgrade request once the blank
    /// line terminator has arrived.
    async fn process_upgrade(self: &Arc<Self>, buf: &mut BytesMut) -> Result<()> {
        let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") else {
            // request still incomplete
            return Ok(());
        };
        let request_bytes = buf.split_to(end + 4);
        let request = String::from_utf8_lossy(&request_bytes).into_owned();

        if !request.starts_with("GET") {
            warn!(addr = %self.addr, "upgrade request is not a GET");
            self.close_with(ErrorKind::UpgradeFail, None).await;
            return Ok(());
        }

        let headers = handshake::parse_request_headers(&request);
        if !self.hooks.verify_handshake(&headers, &request) {
            debug!(addr = %self.addr, "handshake rejected by host");
            self.close_with(ErrorKind::UpgradeFail, None).await;
            return Ok(());
        }

        let Some(key) = headers.get(handshake::SEC_WEBSOCKET_KEY) else {
            warn!(addr = %self.addr, "upgrade request lacks Sec-WebSocket-Key");
            self.close_with(ErrorKind::UpgradeFail, None).await;
            return Ok(());
        };

        let response = handshake::upgrade_response(key);
        let written = {
            let mut write_end = self.write_end.lock().await;
            write_end.write_raw(response.as_bytes()).await
        };
        if let Err(err) = written {
            self.close_with(ErrorKind::UpgradeFail, Some(err)).await;
            return Ok(());
        }

        self.set_state(ConnectionState::Upgraded);
        debug!(addr = %self.addr, "connection upgraded");

        if let Err(err) = self.hooks.on_upgraded(self).await {
            self.close_with(ErrorKind::HandlingException, None).await;
            return Err(err);
        }
        Ok(())
    }

    /// Decodes and dispatches every complete frame sitting in the buffer.
    async fn drain_frames(self: &Arc<Self>, decoder: &mut Decoder, buf: &mut BytesMut) -> Result<()> {
        loop {
            if self.is_disconnecting() || self.state() != ConnectionState::Upgraded {
                return Ok(());
            }

            let frame = match decoder.decode(buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.close_with(ErrorKind::MessageTooLarge, Some(err)).await;
                    return Ok(());
                }
            };

            self.dispatch_frame(frame).await?;
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        if !frame.is_fin() {
            self.close_with(ErrorKind::MessageUnfinished, None).await;
            return Ok(());
        }
        if !frame.is_masked() {
            self.close_with(ErrorKind::MissingMask, None).await;
            return Ok(());
        }

        match frame.opcode() {
            OpCode::Text => {
                let text = String::from_utf8_lossy(frame.payload()).into_owned();
                if text == self.options.disconnect_phrase {
                    debug!(addr = %self.addr, "peer sent disconnect phrase");
                    self.disconnect(DisconnectReason::Requested, "", None).await;
                } else if let Err(err) = self.hooks.on_message(self, &text).await {
                    self.close_with(ErrorKind::HandlingException, None).await;
                    return Err(err);
                }
            }
            OpCode::Binary => {
                if let Err(err) = self.hooks.on_data(self, frame.payload()).await {
                    self.close_with(ErrorKind::HandlingException, None).await;
                    return Err(err);
                }
            }
            OpCode::Close => {
                debug!(addr = %self.addr, "peer sent close");
                self.disconnect(DisconnectReason::Requested, "", None).await;
            }
            OpCode::Ping => {
                // Answered with a Pong echoing the payload.
                let _ = self.outbound_tx.send((OpCode::Pong, frame.into_payload()));
            }
            OpCode::Pong => {
                self.ponged.store(true, Ordering::SeqCst);
                self.pong_signal.notify_one();
            }
            OpCode::Continuation | OpCode::Reserved(_) => {}
        }
        Ok(())
    }

    /// Writer activity: drains the outbound FIFO one message at a time.
    async fn write_loop(self: &Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<(OpCode, Bytes)>) {
        loop {
            if self.is_disconnecting() {
                break;
            }

            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = outbound_rx.recv() => next,
            };
            let Some((opcode, payload)) = next else {
                break;
            };

            if !matches!(
                self.state(),
                ConnectionState::Upgraded | ConnectionState::Closing
            ) {
                continue;
            }

            if opcode == OpCode::Close {
                self.disconnect(DisconnectReason::Requested, "", None).await;
                break;
            }

            if let Err((kind, error)) = self.send_now(opcode, payload).await {
                self.close_with(kind, error).await;
                break;
            }
        }
        // The queue dies with this loop; anything still enqueued is dropped.
    }

    /// Sends one message, splitting it into frames within the configured
    /// bounds.
    async fn send_now(
        &self,
        opcode: OpCode,
        payload: Bytes,
    ) -> std::result::Result<(), (ErrorKind, Option<Error>)> {
        let messaging = &self.options.messaging;
        let frame = Frame::new(true, opcode, None, payload);

        if !opcode.is_control() {
            let total = Frame::wire_size(frame.payload().len(), messaging.max_frame_send_bytes);
            if total > messaging.max_message_send_bytes {
                return Err((
                    ErrorKind::MessageTooLarge,
                    Some(Error::MessageTooLarge {
                        size: total,
                        limit: messaging.max_message_send_bytes,
                    }),
                ));
            }
        }

        let mut write_end = self.write_end.lock().await;
        if self.is_disconnecting() {
            // A disconnect won the lock first; the Close frame is already out.
            return Ok(());
        }
        let result = if opcode.is_control() {
            write_end.send(frame).await
        } else {
            let mut result = Ok(());
            for fragment in frame.into_fragments(messaging.max_frame_send_bytes) {
                result = write_end.send(fragment).await;
                if result.is_err() {
                    break;
                }
            }
            result
        };
        drop(write_end);

        result.map_err(|err| (ErrorKind::WriteError, Some(err)))
    }

    /// Pinger activity: periodic keep-alive with round-trip measurement.
    async fn ping_loop(self: &Arc<Self>) {
        if !self.options.auto_ping.enabled {
            return;
        }

        let interval = Duration::from_secs(self.options.auto_ping.interval_secs);
        let timeout_ms = self.options.auto_ping.timeout_secs.saturating_mul(1000);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(interval) => {}
            }
            if self.is_disconnecting() {
                return;
            }
            if self.state() != ConnectionState::Upgraded {
                continue;
            }

            let measured = self.ping(timeout_ms).await;
            if measured < 0 {
                if !self.is_disconnecting() {
                    warn!(addr = %self.addr, "keep-alive ping timed out");
                    self.disconnect(DisconnectReason::Timeout, "Ping timeout", None)
                        .await;
                }
                return;
            }
            debug!(addr = %self.addr, ping_ms = measured, "keep-alive pong received");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("ping_millis", &self.ping_millis())
            .finish_non_exhaustive()
    }
}
