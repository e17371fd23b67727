use super::config::TransportConfig;
use super::types::{
    ConnectionObserver, ConnectionState, MessageIdAllocator, TransportError, TransportResult,
};
use super::waiter::{Waiter, WaiterTable};
use crate::protocol::{Decoded, Frame, FrameError, frame};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One framed TCP connection
///
/// Features:
/// - Reader task reassembling frames from a private accumulation buffer
/// - Writer task draining a bounded outbound queue (full queue blocks senders)
/// - Keepalive frame every `keepalive_interval`
/// - Waiter table for correlated requests, swept for stale entries
/// - Observers notified on connect, message and close
///
/// A connection is never reused after close; dial or accept a new one.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    config: TransportConfig,
    state: RwLock<ConnectionState>,
    ids: MessageIdAllocator,
    outbound: mpsc::Sender<Bytes>,
    waiters: WaiterTable,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Take ownership of a connected socket and start its tasks
    ///
    /// `shutdown` is the parent cancellation signal; cancelling it closes
    /// the connection.
    pub fn spawn(
        stream: TcpStream,
        config: TransportConfig,
        observers: Vec<Arc<dyn ConnectionObserver>>,
        shutdown: &CancellationToken,
    ) -> TransportResult<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.outbound_queue_capacity);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            config,
            state: RwLock::new(ConnectionState::Connected),
            ids: MessageIdAllocator::new(),
            outbound: tx,
            waiters: WaiterTable::new(),
            observers,
            cancel: shutdown.child_token(),
        });

        debug!("Connection {} established with {}", conn.id, conn.peer);

        for observer in &conn.observers {
            observer.on_connect(&conn);
        }

        tokio::spawn(Arc::clone(&conn).read_loop(reader));
        tokio::spawn(Arc::clone(&conn).write_loop(writer, rx));
        tokio::spawn(Arc::clone(&conn).keepalive_loop());
        tokio::spawn(Arc::clone(&conn).sweep_loop());

        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn pending_requests(&self) -> usize {
        self.waiters.len()
    }

    /// Send a correlated request; await the returned waiter for the reply
    pub async fn send(&self, payload: impl Into<Bytes>) -> TransportResult<Waiter> {
        let payload = payload.into();
        self.check_size(&payload)?;
        let message_id = self.ids.next_id();
        let waiter = self.waiters.register(message_id);
        self.enqueue(frame::encode(message_id, &payload)).await?;
        Ok(waiter)
    }

    /// `send` followed by `wait` with the configured waiter timeout
    pub async fn request(&self, payload: impl Into<Bytes>) -> TransportResult<Bytes> {
        let waiter = self.send(payload).await?;
        waiter.wait(self.config.waiter_timeout()).await
    }

    /// Fire-and-forget frame; returns the allocated message id
    pub async fn write(&self, payload: impl Into<Bytes>) -> TransportResult<i64> {
        let payload = payload.into();
        self.check_size(&payload)?;
        let message_id = self.ids.next_id();
        self.enqueue(frame::encode(message_id, &payload)).await?;
        Ok(message_id)
    }

    /// Reply to a peer's request, reusing its message id
    pub async fn respond(&self, message_id: i64, payload: impl Into<Bytes>) -> TransportResult<()> {
        let payload = payload.into();
        self.check_size(&payload)?;
        self.enqueue(frame::encode(message_id, &payload)).await
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Close the connection
    ///
    /// Outstanding waiters fail with `Closed`, then close observers run.
    /// Repeated calls are no-ops.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        self.cancel.cancel();
        let failed = self.waiters.close_all();
        if failed > 0 {
            debug!(
                "Connection {} closed with {} pending requests",
                self.id, failed
            );
        }

        for observer in &self.observers {
            observer.on_close(self);
        }

        info!("Connection {} to {} closed", self.id, self.peer);
    }

    /// The peer drops any frame above its cap, so refuse to send one
    fn check_size(&self, payload: &[u8]) -> TransportResult<()> {
        let declared = frame::MESSAGE_ID_LEN + payload.len();
        if declared > self.config.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                declared,
                limit: self.config.max_frame_len,
            }
            .into());
        }
        Ok(())
    }

    async fn enqueue(&self, frame: Bytes) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            sent = self.outbound.send(frame) => sent.map_err(|_| TransportError::Closed),
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buffer = BytesMut::with_capacity(self.config.read_buffer_size);

        loop {
            buffer.reserve(self.config.read_buffer_size);

            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = read_with_timeout(&mut reader, &mut buffer, self.config.read_timeout()) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Connection {} reached EOF", self.id);
                    break;
                }
                Ok(n) => {
                    trace!("Connection {} read {} bytes", self.id, n);
                    self.drain_frames(&mut buffer);
                }
                Err(e) => {
                    warn!("Connection {} read failed: {}", self.id, e);
                    break;
                }
            }
        }

        self.close();
    }

    fn drain_frames(self: &Arc<Self>, buffer: &mut BytesMut) {
        loop {
            match frame::decode(buffer, self.config.max_frame_len) {
                Ok(Decoded::Incomplete) => return,
                Ok(Decoded::Frame { frame, consumed }) => {
                    buffer.advance(consumed);
                    self.dispatch(frame);
                }
                Err(e) => {
                    error!(
                        "Connection {} dropping {} buffered bytes: {}",
                        self.id,
                        buffer.len(),
                        e
                    );
                    buffer.clear();
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        if frame.is_keepalive() {
            trace!("Connection {} keepalive", self.id);
            return;
        }

        if frame.is_correlatable() {
            self.waiters.deliver(frame.message_id, frame.payload.clone());
        }

        for observer in &self.observers {
            observer.on_message(self, &frame);
        }
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            // Queued frames win over cancellation so replies enqueued before
            // close still reach the peer
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            if let Err(e) = write_with_timeout(&mut writer, &frame, self.config.write_timeout()).await
            {
                warn!("Connection {} write failed: {}", self.id, e);
                self.close();
                break;
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let keepalive = frame::Frame::keepalive().encode();
        let mut ticker = tokio::time::interval(self.config.keepalive_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.enqueue(keepalive.clone()).await {
                        debug!("Connection {} keepalive stopped: {}", self.id, e);
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let max_age = self.config.waiter_timeout();
        let mut ticker = tokio::time::interval(self.config.waiter_sweep_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.waiters.sweep(max_age);
                    if removed > 0 {
                        debug!("Connection {} swept {} stale waiters", self.id, removed);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_with_timeout(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
    timeout: Option<Duration>,
) -> TransportResult<usize> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buffer)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(TransportError::Timeout),
        },
        None => Ok(reader.read_buf(buffer).await?),
    }
}

async fn write_with_timeout(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    timeout: Option<Duration>,
) -> TransportResult<()> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, writer.write_all(frame)).await {
            Ok(written) => Ok(written?),
            Err(_) => Err(TransportError::Timeout),
        },
        None => Ok(writer.write_all(frame).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Frame>>,
        closed: Mutex<u32>,
    }

    impl ConnectionObserver for Recorder {
        fn on_message(&self, _conn: &Arc<Connection>, frame: &Frame) {
            self.messages.lock().push(frame.clone());
        }

        fn on_close(&self, _conn: &Arc<Connection>) {
            *self.closed.lock() += 1;
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_frames_reach_observer_in_order() {
        let (client, mut raw_peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let conn = Connection::spawn(
            client,
            TransportConfig::default(),
            vec![recorder.clone() as Arc<dyn ConnectionObserver>],
            &shutdown,
        )
        .unwrap();

        let mut wire = Vec::new();
        wire.extend_from_slice(&frame::encode(5, b"one"));
        wire.extend_from_slice(&Frame::keepalive().encode());
        wire.extend_from_slice(b"junk");
        wire.extend_from_slice(&frame::encode(6, b"two"));
        raw_peer.write_all(&wire).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let messages = recorder.messages.lock().clone();
        assert_eq!(
            messages,
            vec![Frame::new(5, &b"one"[..]), Frame::new(6, &b"two"[..])]
        );
        assert!(conn.is_connected());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_peer_eof_closes_and_fails_waiters() {
        let (client, raw_peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let conn = Connection::spawn(
            client,
            TransportConfig::default(),
            vec![recorder.clone() as Arc<dyn ConnectionObserver>],
            &shutdown,
        )
        .unwrap();

        let waiter = conn.send(&b"ping"[..]).await.unwrap();
        drop(raw_peer);

        let err = waiter.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*recorder.closed.lock(), 1);

        assert!(matches!(
            conn.write(&b"late"[..]).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _raw_peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let shutdown = CancellationToken::new();
        let conn = Connection::spawn(
            client,
            TransportConfig::default(),
            vec![recorder.clone() as Arc<dyn ConnectionObserver>],
            &shutdown,
        )
        .unwrap();

        conn.close();
        conn.close();
        assert_eq!(*recorder.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_is_sent() {
        let (client, mut raw_peer) = socket_pair().await;
        let shutdown = CancellationToken::new();
        let config = TransportConfig {
            keepalive_interval_ms: 50,
            ..TransportConfig::default()
        };
        let _conn = Connection::spawn(client, config, Vec::new(), &shutdown).unwrap();

        let mut buf = vec![0u8; 16];
        tokio::time::timeout(Duration::from_secs(2), raw_peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match frame::decode(&buf, frame::DEFAULT_MAX_FRAME_LEN).unwrap() {
            Decoded::Frame { frame, .. } => assert!(frame.is_keepalive()),
            other => panic!("unexpected {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let (client, _raw_peer) = socket_pair().await;
        let shutdown = CancellationToken::new();
        let conn = Connection::spawn(client, TransportConfig::default(), Vec::new(), &shutdown)
            .unwrap();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused() {
        let (client, mut raw_peer) = socket_pair().await;
        let shutdown = CancellationToken::new();
        let config = TransportConfig {
            max_frame_len: 64,
            ..TransportConfig::default()
        };
        let conn = Connection::spawn(client, config, Vec::new(), &shutdown).unwrap();

        let too_large = FrameError::FrameTooLarge {
            declared: 108,
            limit: 64,
        };
        match conn.write(vec![7u8; 100]).await {
            Err(TransportError::Frame(e)) => assert_eq!(e, too_large),
            other => panic!("unexpected {:?}", other),
        }
        match conn.send(vec![7u8; 100]).await {
            Err(TransportError::Frame(e)) => assert_eq!(e, too_large),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            conn.respond(9, vec![7u8; 100]).await,
            Err(TransportError::Frame(_))
        ));
        assert_eq!(conn.pending_requests(), 0);
        assert!(conn.is_connected());

        // Exactly at the cap still goes out
        let id = conn.write(vec![3u8; 56]).await.unwrap();
        let mut buf = vec![0u8; frame::HEADER_LEN + 64];
        tokio::time::timeout(Duration::from_secs(2), raw_peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match frame::decode(&buf, 64).unwrap() {
            Decoded::Frame { frame, .. } => {
                assert_eq!(frame.message_id, id);
                assert_eq!(&frame.payload[..], &[3u8; 56][..]);
            }
            other => panic!("unexpected {:?}", other),
        }
        shutdown.cancel();
    }
}
