//! In-process coordination backend
//!
//! Mirrors the Consul semantics the relay depends on: sessions expire when
//! not renewed within their TTL and take their locks with them, acquire is
//! re-entrant for the holding session, and registry changes bump a blocking
//! query index. Expiry is evaluated lazily on every call.

use super::config::MIN_SESSION_TTL;
use super::coordinator::Coordinator;
use super::types::{
    ClusterError, ClusterResult, HEALTH_PASSING, ServiceEntry, ServiceRegistration,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

struct Lease {
    name: String,
    ttl: Duration,
    renewed_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Lease>,
    locks: HashMap<String, String>,
    services: BTreeMap<String, ServiceEntry>,
    index: u64,
}

impl MemoryState {
    fn expire_sessions(&mut self) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, lease)| lease.renewed_at.elapsed() > lease.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = self.sessions.remove(&id) {
                debug!("Session {} ({}) expired", id, lease.name);
            }
            self.locks.retain(|_, holder| holder != &id);
        }
    }

    fn check_session(&self, session_id: &str) -> ClusterResult<()> {
        if session_id.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        if !self.sessions.contains_key(session_id) {
            return Err(ClusterError::InvalidSession(session_id.to_string()));
        }
        Ok(())
    }

    fn entries(&self, service_name: &str) -> Vec<ServiceEntry> {
        self.services
            .values()
            .filter(|entry| entry.name == service_name)
            .cloned()
            .collect()
    }
}

/// Coordination backend living in process memory
pub struct MemoryCoordinator {
    state: Mutex<MemoryState>,
    index_tx: watch::Sender<u64>,
    min_session_ttl: Duration,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_min_session_ttl(MIN_SESSION_TTL)
    }

    /// Backend whose TTL floor is `min_ttl` instead of ten seconds
    pub fn with_min_session_ttl(min_ttl: Duration) -> Self {
        let (index_tx, _) = watch::channel(1);
        Self {
            state: Mutex::new(MemoryState {
                index: 1,
                ..MemoryState::default()
            }),
            index_tx,
            min_session_ttl: min_ttl,
        }
    }

    /// Override the health status of a registry entry
    pub fn set_health(&self, service_id: &str, status: &str) -> bool {
        let mut state = self.state.lock();
        let updated = match state.services.get_mut(service_id) {
            Some(entry) => {
                entry.status = status.to_string();
                true
            }
            None => false,
        };
        if updated {
            self.bump(&mut state);
        }
        updated
    }

    pub fn session_count(&self) -> usize {
        let mut state = self.state.lock();
        state.expire_sessions();
        state.sessions.len()
    }

    fn bump(&self, state: &mut MemoryState) {
        state.index += 1;
        self.index_tx.send_replace(state.index);
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn create_session(&self, name: &str, ttl: Duration) -> ClusterResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut state = self.state.lock();
        state.expire_sessions();
        state.sessions.insert(
            id.clone(),
            Lease {
                name: name.to_string(),
                ttl: ttl.max(self.min_session_ttl),
                renewed_at: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn renew_session(&self, session_id: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.expire_sessions();
        state.check_session(session_id)?;
        if let Some(lease) = state.sessions.get_mut(session_id) {
            lease.renewed_at = Instant::now();
        }
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.sessions.remove(session_id);
        state.locks.retain(|_, holder| holder != session_id);
        Ok(())
    }

    async fn acquire(&self, key: &str, session_id: &str) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.expire_sessions();
        state.check_session(session_id)?;
        match state.locks.get(key) {
            Some(holder) => Ok(holder == session_id),
            None => {
                state.locks.insert(key.to_string(), session_id.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, session_id: &str) -> ClusterResult<bool> {
        let mut state = self.state.lock();
        state.expire_sessions();
        state.check_session(session_id)?;
        if state.locks.get(key).is_some_and(|holder| holder == session_id) {
            state.locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        state.locks.remove(key);
        Ok(())
    }

    async fn lock_holder(&self, key: &str) -> ClusterResult<Option<String>> {
        let mut state = self.state.lock();
        state.expire_sessions();
        Ok(state.locks.get(key).cloned())
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> ClusterResult<()> {
        let mut state = self.state.lock();
        let status = state
            .services
            .get(&registration.id)
            .map(|entry| entry.status.clone())
            .unwrap_or_else(|| HEALTH_PASSING.to_string());
        state.services.insert(
            registration.id.clone(),
            ServiceEntry {
                id: registration.id.clone(),
                name: registration.name.clone(),
                address: registration.address.clone(),
                port: registration.port,
                tags: registration.tags.clone(),
                status,
            },
        );
        self.bump(&mut state);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> ClusterResult<()> {
        let mut state = self.state.lock();
        if state.services.remove(service_id).is_some() {
            self.bump(&mut state);
        }
        Ok(())
    }

    async fn services(&self, service_name: &str) -> ClusterResult<Vec<ServiceEntry>> {
        Ok(self.state.lock().entries(service_name))
    }

    async fn watch_services(
        &self,
        service_name: &str,
        index: u64,
        wait: Duration,
    ) -> ClusterResult<(Vec<ServiceEntry>, u64)> {
        let mut rx = self.index_tx.subscribe();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let current = *rx.borrow_and_update();
            if current > index {
                break;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => break,
            }
        }

        let state = self.state.lock();
        Ok((state.entries(service_name), state.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: &str) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: "relay".to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            tags: vec!["0".to_string()],
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_reentrant() {
        let backend = MemoryCoordinator::new();
        let a = backend.create_session("a", Duration::from_secs(10)).await.unwrap();
        let b = backend.create_session("b", Duration::from_secs(10)).await.unwrap();

        assert!(backend.acquire("lock", &a).await.unwrap());
        assert!(backend.acquire("lock", &a).await.unwrap());
        assert!(!backend.acquire("lock", &b).await.unwrap());
        assert!(!backend.release("lock", &b).await.unwrap());

        assert!(backend.release("lock", &a).await.unwrap());
        assert!(backend.acquire("lock", &b).await.unwrap());
        assert_eq!(backend.lock_holder("lock").await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_force_delete_frees_lock() {
        let backend = MemoryCoordinator::new();
        let a = backend.create_session("a", Duration::from_secs(10)).await.unwrap();
        let b = backend.create_session("b", Duration::from_secs(10)).await.unwrap();
        assert!(backend.acquire("lock", &a).await.unwrap());

        backend.delete("lock").await.unwrap();
        assert!(backend.acquire("lock", &b).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_session_releases_lock() {
        let backend = MemoryCoordinator::with_min_session_ttl(Duration::from_millis(50));
        let a = backend.create_session("a", Duration::from_millis(50)).await.unwrap();
        let b = backend.create_session("b", Duration::from_secs(10)).await.unwrap();
        assert!(backend.acquire("lock", &a).await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(backend.acquire("lock", &b).await.unwrap());
        assert!(matches!(
            backend.renew_session(&a).await,
            Err(ClusterError::InvalidSession(_))
        ));
        assert_eq!(backend.session_count(), 1);
    }

    #[tokio::test]
    async fn test_ttl_is_clamped_to_minimum() {
        let backend = MemoryCoordinator::with_min_session_ttl(Duration::from_millis(200));
        let a = backend.create_session("a", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.renew_session(&a).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_session_rejected() {
        let backend = MemoryCoordinator::new();
        assert!(matches!(
            backend.acquire("lock", "").await,
            Err(ClusterError::SessionEmpty)
        ));
    }

    #[tokio::test]
    async fn test_watch_returns_on_change() {
        let backend = std::sync::Arc::new(MemoryCoordinator::new());
        let (_, index) = backend
            .watch_services("relay", 0, Duration::from_secs(1))
            .await
            .unwrap();

        let watcher = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .watch_services("relay", index, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.register_service(&registration("n1")).await.unwrap();

        let (entries, new_index) = watcher.await.unwrap();
        assert!(new_index > index);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, HEALTH_PASSING);
    }

    #[tokio::test]
    async fn test_watch_times_out_without_change() {
        let backend = MemoryCoordinator::new();
        let (_, index) = backend
            .watch_services("relay", 0, Duration::from_millis(10))
            .await
            .unwrap();
        let started = Instant::now();
        let (_, same) = backend
            .watch_services("relay", index, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(same, index);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_set_health_bumps_index() {
        let backend = MemoryCoordinator::new();
        backend.register_service(&registration("n1")).await.unwrap();
        let (_, index) = backend
            .watch_services("relay", 0, Duration::from_millis(10))
            .await
            .unwrap();

        assert!(backend.set_health("n1", "critical"));
        let (entries, new_index) = backend
            .watch_services("relay", index, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(new_index > index);
        assert_eq!(entries[0].status, "critical");
    }
}
