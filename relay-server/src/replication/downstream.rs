use super::types::{ReplicationError, ReplicationResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reload target meaning every registered service
pub const RELOAD_ALL: &str = "all";

/// A local consumer of relayed events
#[async_trait]
pub trait DownstreamService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> ReplicationResult<()>;

    async fn close(&self);

    async fn reload(&self) -> ReplicationResult<()>;

    /// Deliver an event payload routed by `topic`
    async fn send_all(&self, topic: &str, payload: &Bytes) -> bool;

    /// Deliver an opaque envelope as received
    async fn send_raw(&self, frame: &Bytes) -> bool;
}

/// Registered downstream services, invoked in registration order
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn DownstreamService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn DownstreamService>) {
        info!("Registered downstream service {}", service.name());
        self.services.write().push(service);
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn DownstreamService>> {
        self.services.read().clone()
    }

    pub async fn start_all(&self) -> ReplicationResult<()> {
        for service in self.snapshot() {
            service.start().await.map_err(|e| {
                ReplicationError::Service(format!("{} failed to start: {}", service.name(), e))
            })?;
            debug!("Downstream service {} started", service.name());
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        for service in self.snapshot() {
            service.close().await;
            debug!("Downstream service {} closed", service.name());
        }
    }

    /// Reload the service named `target`, or every service for `all`
    ///
    /// Returns how many services were reloaded.
    pub async fn reload(&self, target: &str) -> ReplicationResult<usize> {
        let target = target.trim();
        let mut reloaded = 0;
        for service in self.snapshot() {
            if target != RELOAD_ALL && service.name() != target {
                continue;
            }
            service.reload().await?;
            info!("Reloaded downstream service {}", service.name());
            reloaded += 1;
        }
        if reloaded == 0 && target != RELOAD_ALL {
            return Err(ReplicationError::Service(format!(
                "no service named {}",
                target
            )));
        }
        Ok(reloaded)
    }

    /// Fan out an event; returns how many services accepted it
    pub async fn send_all(&self, topic: &str, payload: &Bytes) -> usize {
        let mut accepted = 0;
        for service in self.snapshot() {
            if service.send_all(topic, payload).await {
                accepted += 1;
            } else {
                warn!("{} rejected event on {}", service.name(), topic);
            }
        }
        accepted
    }

    pub async fn send_raw(&self, frame: &Bytes) -> usize {
        let mut accepted = 0;
        for service in self.snapshot() {
            if service.send_raw(frame).await {
                accepted += 1;
            }
        }
        accepted
    }
}

/// Downstream service that writes every event to the log
pub struct LogService {
    name: String,
}

impl LogService {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DownstreamService for LogService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> ReplicationResult<()> {
        Ok(())
    }

    async fn close(&self) {}

    async fn reload(&self) -> ReplicationResult<()> {
        Ok(())
    }

    async fn send_all(&self, topic: &str, payload: &Bytes) -> bool {
        info!(
            target: "relay::events",
            "{} {}",
            topic,
            String::from_utf8_lossy(payload)
        );
        true
    }

    async fn send_raw(&self, frame: &Bytes) -> bool {
        debug!(target: "relay::events", "raw envelope, {} bytes", frame.len());
        true
    }
}
