use super::config::TransportConfig;
use super::connection::Connection;
use super::types::{ConnectionObserver, ConnectionState, TransportError, TransportResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dial `addr` once and wrap the socket in a [`Connection`]
pub async fn connect(
    addr: &str,
    config: TransportConfig,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    shutdown: &CancellationToken,
) -> TransportResult<Arc<Connection>> {
    let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr)).await
    {
        Ok(stream) => stream?,
        Err(_) => return Err(TransportError::Timeout),
    };
    Connection::spawn(stream, config, observers, shutdown)
}

/// Client that keeps one connection to `addr` alive
///
/// Lost connections are redialed with exponential backoff until `stop` is
/// called or the parent shutdown signal fires.
pub struct ReconnectingClient {
    addr: String,
    config: TransportConfig,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    state: RwLock<ConnectionState>,
    current: RwLock<Option<Arc<Connection>>>,
    cancel: CancellationToken,
}

impl ReconnectingClient {
    pub fn new(
        addr: impl Into<String>,
        config: TransportConfig,
        observers: Vec<Arc<dyn ConnectionObserver>>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            config,
            observers,
            state: RwLock::new(ConnectionState::Disconnected),
            current: RwLock::new(None),
            cancel: shutdown.child_token(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .as_ref()
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Stop reconnecting and close the live connection
    pub fn stop(&self) {
        self.cancel.cancel();
        let current = self.current.write().take();
        if let Some(conn) = current {
            conn.close();
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn write(&self, payload: impl Into<Bytes>) -> TransportResult<i64> {
        let conn = self.connection().ok_or(TransportError::NotConnected)?;
        conn.write(payload).await
    }

    pub async fn request(&self, payload: impl Into<Bytes>) -> TransportResult<Bytes> {
        let conn = self.connection().ok_or(TransportError::NotConnected)?;
        conn.request(payload).await
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_backoff();

        while !self.cancel.is_cancelled() {
            *self.state.write() = ConnectionState::Connecting;
            debug!("Dialing {}", self.addr);

            match connect(&self.addr, self.config.clone(), self.observers.clone(), &self.cancel).await {
                Ok(conn) => {
                    info!("Connected to {}", self.addr);
                    backoff = self.config.reconnect_backoff();
                    *self.current.write() = Some(Arc::clone(&conn));
                    *self.state.write() = ConnectionState::Connected;

                    conn.closed().await;

                    self.current.write().take();
                    *self.state.write() = ConnectionState::Disconnected;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!("Connection to {} lost, reconnecting", self.addr);
                }
                Err(e) => {
                    *self.state.write() = ConnectionState::Disconnected;
                    warn!("Connect to {} failed: {} (retry in {:?})", self.addr, e, backoff);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, self.config.reconnect_backoff_max());
                }
            }
        }

        *self.state.write() = ConnectionState::Disconnected;
        debug!("Client for {} stopped", self.addr);
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
