use super::connection::Connection;
use super::types::ConnectionObserver;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A named set of live connections
///
/// Registered as a connection observer it drops members when they close.
pub struct ConnectionGroup {
    name: String,
    members: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a live connection; closed connections are ignored
    pub fn add(&self, conn: &Arc<Connection>) {
        if !conn.is_connected() {
            return;
        }
        let previous = self.members.write().insert(conn.id(), Arc::clone(conn));
        if previous.is_none() {
            debug!(
                "Group {} added connection {} ({})",
                self.name,
                conn.id(),
                conn.peer_addr()
            );
        }
    }

    pub fn remove(&self, conn_id: u64) -> bool {
        self.members.write().remove(&conn_id).is_some()
    }

    pub fn contains(&self, conn_id: u64) -> bool {
        self.members.read().contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.members.read().values().cloned().collect()
    }

    /// Write `payload` to every member; returns how many accepted it
    pub async fn broadcast(&self, payload: Bytes) -> usize {
        let mut delivered = 0;
        for conn in self.connections() {
            match conn.write(payload.clone()).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!(
                    "Group {} write to connection {} failed: {}",
                    self.name,
                    conn.id(),
                    e
                ),
            }
        }
        delivered
    }

    /// Close and forget every member
    pub fn close_all(&self) {
        let members: Vec<_> = self.members.write().drain().map(|(_, c)| c).collect();
        for conn in members {
            conn.close();
        }
    }
}

impl ConnectionObserver for ConnectionGroup {
    fn on_close(&self, conn: &Arc<Connection>) {
        if self.remove(conn.id()) {
            debug!("Group {} removed connection {}", self.name, conn.id());
        }
    }
}
