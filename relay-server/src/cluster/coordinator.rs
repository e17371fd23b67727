use super::types::{ClusterResult, ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use std::time::Duration;

/// Coordination backend: sessions, KV locks and a service registry
///
/// A session is a renewable lease. Locks are KV keys bound to a session;
/// when the session expires or is destroyed the key is deleted.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a session with delete-on-expire behavior; returns its id
    async fn create_session(&self, name: &str, ttl: Duration) -> ClusterResult<String>;

    async fn renew_session(&self, session_id: &str) -> ClusterResult<()>;

    async fn destroy_session(&self, session_id: &str) -> ClusterResult<()>;

    /// Bind `key` to the session; true when the session now holds it
    async fn acquire(&self, key: &str, session_id: &str) -> ClusterResult<bool>;

    /// Unbind `key` if held by the session
    async fn release(&self, key: &str, session_id: &str) -> ClusterResult<bool>;

    /// Delete `key` unconditionally, whoever holds it
    async fn delete(&self, key: &str) -> ClusterResult<()>;

    /// Session currently holding `key`
    async fn lock_holder(&self, key: &str) -> ClusterResult<Option<String>>;

    async fn register_service(&self, registration: &ServiceRegistration) -> ClusterResult<()>;

    async fn deregister_service(&self, service_id: &str) -> ClusterResult<()>;

    /// Report the service's TTL health check as passing
    ///
    /// Backends without health checks accept this as a no-op.
    async fn pass_check(&self, _service_id: &str) -> ClusterResult<()> {
        Ok(())
    }

    /// Registry entries for `service_name`
    async fn services(&self, service_name: &str) -> ClusterResult<Vec<ServiceEntry>>;

    /// Blocking query: returns once the registry index moves past `index`
    /// or `wait` elapses, with the entries and the new index
    async fn watch_services(
        &self,
        service_name: &str,
        index: u64,
        wait: Duration,
    ) -> ClusterResult<(Vec<ServiceEntry>, u64)>;
}
