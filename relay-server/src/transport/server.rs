use super::config::TransportConfig;
use super::connection::Connection;
use super::types::{ConnectionObserver, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Accepting side of the frame protocol
///
/// Every accepted socket becomes a [`Connection`] sharing the same observers.
pub struct FrameServer {
    name: String,
    listener: TcpListener,
    config: TransportConfig,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl FrameServer {
    pub async fn bind(
        name: impl Into<String>,
        addr: &str,
        config: TransportConfig,
        observers: Vec<Arc<dyn ConnectionObserver>>,
    ) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let name = name.into();
        info!("{} listening on {}", name, listener.local_addr()?);
        Ok(Self {
            name,
            listener,
            config,
            observers,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    match Connection::spawn(
                        stream,
                        self.config.clone(),
                        self.observers.clone(),
                        &shutdown,
                    ) {
                        Ok(conn) => info!("{} accepted {} as connection {}", self.name, peer, conn.id()),
                        Err(e) => warn!("{} failed to set up connection from {}: {}", self.name, peer, e),
                    }
                }
                Err(e) => {
                    error!("{} accept error: {}", self.name, e);
                }
            }
        }

        info!("{} stopped accepting", self.name);
    }

    /// Run the accept loop on a background task
    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
