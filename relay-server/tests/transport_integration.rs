//! Frame transport over real sockets
//!
//! - Concurrent requests on one connection are matched to their replies
//! - A reader resynchronizes after garbage on the wire
//! - A server-side close fails outstanding requests

use bytes::Bytes;
use relay_server::protocol::frame::{self, DEFAULT_MAX_FRAME_LEN, Decoded};
use relay_server::transport::{
    self, Connection, ConnectionObserver, FrameServer, TransportConfig, TransportError,
};
use relay_server::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Replies to every frame with `echo:<payload>`, after a delay encoded in
/// the first payload byte (tens of milliseconds)
struct Echo;

impl ConnectionObserver for Echo {
    fn on_message(&self, conn: &Arc<Connection>, frame: &Frame) {
        let conn = Arc::clone(conn);
        let frame = frame.clone();
        tokio::spawn(async move {
            let delay = frame.payload.first().copied().unwrap_or(0) as u64 * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&frame.payload);
            let _ = conn.respond(frame.message_id, reply).await;
        });
    }
}

/// Accepts frames and never answers
struct Silent;

impl ConnectionObserver for Silent {}

async fn start_server(
    observer: Arc<dyn ConnectionObserver>,
    shutdown: &CancellationToken,
) -> String {
    let server = FrameServer::bind("test", "127.0.0.1:0", TransportConfig::default(), vec![observer])
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    server.start(shutdown.clone());
    addr
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let shutdown = CancellationToken::new();
    let addr = start_server(Arc::new(Echo), &shutdown).await;

    let conn = transport::connect(&addr, TransportConfig::default(), Vec::new(), &shutdown)
        .await
        .unwrap();

    // Replies come back in reverse order of the requests
    let (a, b, c) = tokio::join!(
        conn.request(Bytes::from_static(&[3, b'a'])),
        conn.request(Bytes::from_static(&[2, b'b'])),
        conn.request(Bytes::from_static(&[1, b'c'])),
    );
    assert_eq!(&a.unwrap()[..], &b"echo:\x03a"[..]);
    assert_eq!(&b.unwrap()[..], &b"echo:\x02b"[..]);
    assert_eq!(&c.unwrap()[..], &b"echo:\x01c"[..]);
    assert_eq!(conn.pending_requests(), 0);

    shutdown.cancel();
}

/// Raw peer: collects `count` frames, then echoes them in reverse order,
/// each preceded by non-protocol noise
async fn noisy_echo_peer(listener: TcpListener, count: usize) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut frames = Vec::new();
    while frames.len() < count {
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed early");
        buf.extend_from_slice(&chunk[..n]);
        while let Decoded::Frame { frame, consumed } =
            frame::decode(&buf, DEFAULT_MAX_FRAME_LEN).unwrap()
        {
            buf.drain(..consumed);
            if !frame.is_keepalive() {
                frames.push(frame);
            }
        }
    }

    let mut wire = Vec::new();
    for frame in frames.iter().rev() {
        wire.extend_from_slice(b"noise\x00\xff");
        wire.extend_from_slice(&frame.encode());
    }
    wire.extend_from_slice(b"trailing");
    socket.write_all(&wire).await.unwrap();
    // Hold the socket open until the client is done
    let mut rest = [0u8; 64];
    let _ = socket.read(&mut rest).await;
}

#[tokio::test]
async fn test_echo_with_noise_matches_each_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let peer = tokio::spawn(noisy_echo_peer(listener, 3));

    let shutdown = CancellationToken::new();
    let conn = transport::connect(&addr, TransportConfig::default(), Vec::new(), &shutdown)
        .await
        .unwrap();

    let long = "haha".repeat(64);
    let (hello, word, laugh) = tokio::join!(
        conn.request(Bytes::from_static(b"hello")),
        conn.request(Bytes::from_static(b"word")),
        conn.request(Bytes::from(long.clone())),
    );
    assert_eq!(&hello.unwrap()[..], b"hello");
    assert_eq!(&word.unwrap()[..], b"word");
    assert_eq!(&laugh.unwrap()[..], long.as_bytes());

    conn.close();
    let _ = tokio::time::timeout(Duration::from_secs(2), peer).await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_server_resyncs_after_noise() {
    let shutdown = CancellationToken::new();
    let addr = start_server(Arc::new(Echo), &shutdown).await;

    let mut raw = TcpStream::connect(&addr).await.unwrap();
    let mut wire = b"\x00\x13garbage\xff".to_vec();
    wire.extend_from_slice(&frame::encode(42, &[0, b'x']));
    raw.write_all(&wire).await.unwrap();

    let mut buf = Vec::new();
    let reply = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let mut chunk = [0u8; 256];
            let n = raw.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
            if let Decoded::Frame { frame, .. } =
                frame::decode(&buf, DEFAULT_MAX_FRAME_LEN).unwrap()
            {
                if !frame.is_keepalive() {
                    return frame;
                }
                buf.clear();
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(reply.message_id, 42);
    assert_eq!(&reply.payload[..], &b"echo:\x00x"[..]);
    shutdown.cancel();
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let shutdown = CancellationToken::new();
    let addr = start_server(Arc::new(Silent), &shutdown).await;

    let config = TransportConfig {
        waiter_timeout_ms: 200,
        ..TransportConfig::default()
    };
    let conn = transport::connect(&addr, config, Vec::new(), &shutdown)
        .await
        .unwrap();

    let err = conn.request(&b"anyone?"[..]).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
    assert_eq!(conn.pending_requests(), 0);
    assert!(conn.is_connected());

    shutdown.cancel();
}

#[tokio::test]
async fn test_server_shutdown_fails_pending_requests() {
    let server_shutdown = CancellationToken::new();
    let addr = start_server(Arc::new(Silent), &server_shutdown).await;

    let client_shutdown = CancellationToken::new();
    let conn = transport::connect(&addr, TransportConfig::default(), Vec::new(), &client_shutdown)
        .await
        .unwrap();

    let pending = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.request(&b"hello"[..]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    server_shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransportError::Closed)));
    tokio::time::timeout(Duration::from_secs(1), conn.closed())
        .await
        .unwrap();

    client_shutdown.cancel();
}
