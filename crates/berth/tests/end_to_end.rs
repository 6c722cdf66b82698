//! End-to-end scenarios over real sockets.
//!
//! Each test binds an ephemeral port, drives the server with a raw TCP
//! client speaking RFC 6455 bytes (masked, as a browser would), and observes
//! the host-visible side through recorded session hook events.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use berth::{
    Connection, DisconnectReason, ErrorKind, Frame, OpCode, Result, Server, ServerOptions,
    SessionHooks, Target,
    codec::{Decoder, Encoder, Role},
};
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::codec::{Decoder as _, Encoder as _};

const KEY: &str = "x3JJHMbDL1EzLkh9GBhXDw==";
const ACCEPT: &str = "HSmrc0sMlYUkAGmm5OPpG2HaGWk=";

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(SocketAddr),
    Upgraded(SocketAddr),
    Message(SocketAddr, String),
    Data(SocketAddr, Vec<u8>),
    Disconnected(SocketAddr, DisconnectReason),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl SessionHooks for Recorder {
    async fn on_connected(&self, conn: &Arc<Connection>) -> Result<()> {
        let _ = self.tx.send(Event::Connected(conn.addr()));
        Ok(())
    }

    async fn on_upgraded(&self, conn: &Arc<Connection>) -> Result<()> {
        let _ = self.tx.send(Event::Upgraded(conn.addr()));
        Ok(())
    }

    async fn on_message(&self, conn: &Arc<Connection>, text: &str) -> Result<()> {
        let _ = self.tx.send(Event::Message(conn.addr(), text.to_string()));
        Ok(())
    }

    async fn on_data(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<()> {
        let _ = self.tx.send(Event::Data(conn.addr(), data.to_vec()));
        Ok(())
    }

    async fn on_disconnected(
        &self,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        _error: Option<&berth::Error>,
    ) {
        let _ = self.tx.send(Event::Disconnected(conn.addr(), reason));
    }
}

async fn start_server(
    options: ServerOptions,
) -> (Server, SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = options.with_bind("127.0.0.1".parse().unwrap(), 0);
    let server = Server::new(options, move |_addr: SocketAddr| -> Arc<dyn SessionHooks> {
        Arc::new(Recorder { tx: tx.clone() })
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a hook event")
        .expect("event channel closed")
}

/// Performs the opening handshake and returns the raw response text plus any
/// bytes that followed it.
async fn upgrade(stream: &mut TcpStream) -> (String, BytesMut) {
    let request = format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = BytesMut::new();
    let end = loop {
        if let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break end;
        }
        let n = timeout(Duration::from_secs(5), stream.read_buf(&mut buf))
            .await
            .expect("timed out waiting for the handshake response")
            .unwrap();
        assert!(n > 0, "server closed the stream during the handshake");
    };

    let response = buf.split_to(end + 4);
    (String::from_utf8(response.to_vec()).unwrap(), buf)
}

async fn send_frame(stream: &mut TcpStream, role: Role, frame: Frame) {
    let mut encoder = Encoder::new(role);
    let mut buf = BytesMut::new();
    encoder.encode(frame, &mut buf).unwrap();
    // The server may close mid-write in oversize scenarios; reads decide the
    // test outcome.
    let _ = stream.write_all(&buf).await;
    let _ = stream.flush().await;
}

async fn read_frame(stream: &mut TcpStream, decoder: &mut Decoder, buf: &mut BytesMut) -> Frame {
    loop {
        if let Some(frame) = decoder.decode(buf).unwrap() {
            return frame;
        }
        let n = timeout(Duration::from_secs(5), stream.read_buf(buf))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        assert!(n > 0, "server closed the stream mid-frame");
    }
}

fn close_code(frame: &Frame) -> u16 {
    assert_eq!(frame.opcode(), OpCode::Close);
    frame.close_code().map(u16::from).expect("close without code")
}

#[tokio::test]
async fn test_happy_path_text_message() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();

    let (response, _leftover) = upgrade(&mut stream).await;
    let expected = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {ACCEPT}\r\n\r\n"
    );
    assert_eq!(response, expected);

    send_frame(&mut stream, Role::Client, Frame::text("Hello, World!")).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(peer, "Hello, World!".to_string())
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_binary_message() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    upgrade(&mut stream).await;

    let payload = vec![0u8, 1, 2, 3, 254, 255];
    send_frame(&mut stream, Role::Client, Frame::binary(payload.clone())).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(next_event(&mut events).await, Event::Data(peer, payload));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_phrase() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    send_frame(&mut stream, Role::Client, Frame::text("disconnect")).await;

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1000);

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Requested)
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_close_frame() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    send_frame(
        &mut stream,
        Role::Client,
        Frame::close(berth::CloseCode::Normal, b"bye"),
    )
    .await;

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1000);

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Requested)
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversize_receive() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    // 40 000 bytes against the default 32 768 receive bound
    send_frame(&mut stream, Role::Client, Frame::binary(vec![7u8; 40_000])).await;

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1009);

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Error(ErrorKind::MessageTooLarge))
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_mask() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    // A server-role encoder writes the frame without a mask.
    send_frame(&mut stream, Role::Server, Frame::text("bare")).await;

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1002);

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Error(ErrorKind::MissingMask))
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unfinished_frame() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    send_frame(
        &mut stream,
        Role::Client,
        Frame::text("fragment").with_fin(false),
    )
    .await;

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1002);

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Error(ErrorKind::MessageUnfinished))
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_handshake() {
    struct Rejecting;

    #[async_trait]
    impl SessionHooks for Rejecting {
        fn verify_handshake(&self, _headers: &HashMap<String, String>, _request: &str) -> bool {
            false
        }
    }

    let options = ServerOptions::default().with_bind("127.0.0.1".parse().unwrap(), 0);
    let server = Server::new(options, |_addr: SocketAddr| -> Arc<dyn SessionHooks> {
        Arc::new(Rejecting)
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: localhost\r\nSec-WebSocket-Key: {KEY}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // No 101 comes back, only a protocol-error Close frame.
    let mut decoder = Decoder::new(1 << 20);
    let mut buf = BytesMut::new();
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1002);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_auto_pong_reply() {
    let (server, addr, _events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    send_frame(&mut stream, Role::Client, Frame::ping("are you there")).await;

    let mut decoder = Decoder::new(1 << 20);
    let pong = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(pong.payload().as_ref(), b"are you there");
    assert!(!pong.is_masked());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ping_client_round_trip() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    let conn = server
        .connections()
        .into_iter()
        .find(|conn| conn.addr() == peer)
        .expect("connection registered");

    // Answer the server's Ping from a client task while ping_client waits.
    let responder = tokio::spawn(async move {
        let mut decoder = Decoder::new(1 << 20);
        let ping = read_frame(&mut stream, &mut decoder, &mut buf).await;
        assert_eq!(ping.opcode(), OpCode::Ping);
        assert!(ping.payload().is_empty());
        send_frame(&mut stream, Role::Client, Frame::pong("")).await;
        stream
    });

    let measured = server.ping_client(&conn, 5_000).await.unwrap();
    assert!(measured >= 0, "ping timed out: {measured}");
    assert_eq!(conn.ping_millis(), measured);

    let _stream = responder.await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_auto_ping_timeout() {
    let options = ServerOptions::default().with_auto_ping(1, 1);
    let (server, addr, mut events) = start_server(options).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    // Read the Ping, never answer it.
    let mut decoder = Decoder::new(1 << 20);
    let ping = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(ping.opcode(), OpCode::Ping);

    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1002);

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Timeout)
    );
    assert!(conn_ping_is_timed_out(&server, peer));

    server.stop().await.unwrap();
}

fn conn_ping_is_timed_out(server: &Server, peer: SocketAddr) -> bool {
    // The registry slot may already be cleared once the engine finished; the
    // sentinel is only observable while the record is still present.
    server
        .connections()
        .into_iter()
        .find(|conn| conn.addr() == peer)
        .map(|conn| conn.ping_millis() == -1)
        .unwrap_or(true)
}

#[tokio::test]
async fn test_send_ordering() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    for text in ["A", "B", "C"] {
        server.queue_send_text(Target::Single(peer), text);
    }

    let mut decoder = Decoder::new(1 << 20);
    for expected in ["A", "B", "C"] {
        let frame = read_frame(&mut stream, &mut decoder, &mut buf).await;
        assert_eq!(frame.opcode(), OpCode::Text);
        assert!(frame.is_fin());
        assert!(!frame.is_masked());
        assert_eq!(frame.payload().as_ref(), expected.as_bytes());
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_multi_frame_send() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    // 20 000 bytes against the default 16 384 frame bound: a text head frame
    // plus one finishing continuation.
    let payload: Vec<u8> = (0..20_000).map(|i| b'a' + (i % 26) as u8).collect();
    let text = String::from_utf8(payload.clone()).unwrap();
    server.queue_send_text(Target::Single(peer), &text);

    let mut decoder = Decoder::new(1 << 20);
    let head = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(head.opcode(), OpCode::Text);
    assert!(!head.is_fin());

    let mut reassembled = head.payload().to_vec();
    loop {
        let frame = read_frame(&mut stream, &mut decoder, &mut buf).await;
        assert_eq!(frame.opcode(), OpCode::Continuation);
        reassembled.extend_from_slice(frame.payload());
        if frame.is_fin() {
            break;
        }
    }
    assert_eq!(reassembled, payload);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversize_send_disconnects() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut stream).await;

    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    // Larger than the default 65 535 on-wire send bound.
    server.queue_send_binary(Target::Single(peer), &vec![0u8; 70_000]);

    let mut decoder = Decoder::new(1 << 20);
    let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
    assert_eq!(close_code(&close), 1009);

    assert_eq!(
        next_event(&mut events).await,
        Event::Disconnected(peer, DisconnectReason::Error(ErrorKind::MessageTooLarge))
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_shutdown_drains_peers() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let peer = stream.local_addr().unwrap();
        let (_, buf) = upgrade(&mut stream).await;
        assert_eq!(next_event(&mut events).await, Event::Connected(peer));
        assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));
        clients.push((stream, peer, buf));
    }
    assert_eq!(server.connection_count(), 3);

    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop did not return in time")
        .unwrap();
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);

    let mut disconnected = Vec::new();
    for _ in 0..3 {
        match next_event(&mut events).await {
            Event::Disconnected(peer, DisconnectReason::ServerShutdown) => disconnected.push(peer),
            other => panic!("unexpected event during shutdown: {other:?}"),
        }
    }
    let mut expected: Vec<SocketAddr> = clients.iter().map(|(_, peer, _)| *peer).collect();
    disconnected.sort();
    expected.sort();
    assert_eq!(disconnected, expected);

    for (mut stream, _, mut buf) in clients {
        let mut decoder = Decoder::new(1 << 20);
        let close = read_frame(&mut stream, &mut decoder, &mut buf).await;
        assert_eq!(close_code(&close), 1001);
        assert_eq!(close.close_reason(), Some("Server is shutting down"));
    }
}

#[tokio::test]
async fn test_broadcast_reaches_only_upgraded_peers() {
    let (server, addr, mut events) = start_server(ServerOptions::default()).await;

    // One upgraded peer and one that never sends its handshake.
    let mut upgraded = TcpStream::connect(addr).await.unwrap();
    let peer = upgraded.local_addr().unwrap();
    let (_, mut buf) = upgrade(&mut upgraded).await;
    assert_eq!(next_event(&mut events).await, Event::Connected(peer));
    assert_eq!(next_event(&mut events).await, Event::Upgraded(peer));

    let silent = TcpStream::connect(addr).await.unwrap();
    let silent_peer = silent.local_addr().unwrap();
    assert_eq!(next_event(&mut events).await, Event::Connected(silent_peer));

    assert_eq!(server.connection_count(), 2);

    server.queue_send_text(Target::Upgraded, "to the upgraded");

    let mut decoder = Decoder::new(1 << 20);
    let frame = read_frame(&mut upgraded, &mut decoder, &mut buf).await;
    assert_eq!(frame.payload().as_ref(), b"to the upgraded");

    server.stop().await.unwrap();
}
