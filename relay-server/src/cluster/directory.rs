use super::config::ClusterConfig;
use super::coordinator::Coordinator;
use super::types::{
    ClusterError, ClusterMember, ClusterResult, MemberStatus, MemberTags, ServiceEntry, now_ms,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Read-only view of cluster membership
///
/// Members are derived from registry entries carrying this cluster's lock
/// key. A member is offline only when its heartbeat is older than the
/// keepalive timeout and a direct TCP probe to it fails, since backend
/// health can lag a dead process.
pub struct MemberDirectory {
    backend: Arc<dyn Coordinator>,
    service_name: String,
    lock_key: String,
    keepalive_timeout: Duration,
    probe_timeout: Duration,
}

impl MemberDirectory {
    pub fn new(backend: Arc<dyn Coordinator>, config: &ClusterConfig) -> Self {
        Self {
            backend,
            service_name: config.service_name.clone(),
            lock_key: config.lock_key.clone(),
            keepalive_timeout: config.keepalive_timeout(),
            probe_timeout: config.probe_timeout(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Coordinator> {
        &self.backend
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Members of the configured service
    pub async fn members(&self) -> ClusterResult<Vec<ClusterMember>> {
        self.list_members(&self.service_name).await
    }

    /// Members registered under `service_name` for this cluster
    pub async fn list_members(&self, service_name: &str) -> ClusterResult<Vec<ClusterMember>> {
        let entries = self.backend.services(service_name).await?;
        let now = now_ms();

        let mut members = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some((mut member, stale)) =
                member_from_entry(entry, &self.lock_key, now, self.keepalive_timeout)
            else {
                continue;
            };
            if stale && !probe(&member.service_ip, member.port, self.probe_timeout).await {
                debug!("Member {} is stale and unreachable", member.service_id);
                member.status = MemberStatus::Offline;
            }
            members.push(member);
        }

        members.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });
        Ok(members)
    }

    /// The online member tagged leader
    pub async fn leader(&self) -> ClusterResult<ClusterMember> {
        let members = self.members().await?;
        if members.is_empty() {
            return Err(ClusterError::MembersEmpty);
        }
        members
            .into_iter()
            .find(|m| m.is_leader && m.is_online())
            .ok_or(ClusterError::LeaderNotFound)
    }
}

/// Derive a member from a registry entry
///
/// Returns `None` for foreign entries; the flag reports a heartbeat older
/// than `keepalive_timeout`.
pub fn member_from_entry(
    entry: &ServiceEntry,
    lock_key: &str,
    now_ms: u64,
    keepalive_timeout: Duration,
) -> Option<(ClusterMember, bool)> {
    let tags = MemberTags::from_tags(&entry.tags)?;
    if tags.lock_key != lock_key {
        return None;
    }

    let age = now_ms.saturating_sub(tags.heartbeat_ms);
    let stale = age > keepalive_timeout.as_millis() as u64;

    Some((
        ClusterMember {
            service_id: entry.id.clone(),
            hostname: tags.hostname,
            service_ip: entry.address.clone(),
            port: entry.port,
            is_leader: tags.is_leader,
            status: MemberStatus::Online,
            session_id: tags.session_id,
        },
        stale,
    ))
}

/// TCP liveness probe
pub async fn probe(ip: &str, port: u16, timeout: Duration) -> bool {
    if ip.is_empty() || port == 0 {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCoordinator;
    use crate::cluster::types::ServiceRegistration;

    const LOCK: &str = "relay/leader";

    fn entry(id: &str, leader: bool, heartbeat_ms: u64, lock_key: &str, port: u16) -> ServiceEntry {
        ServiceEntry {
            id: id.to_string(),
            name: "relay".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            tags: MemberTags {
                is_leader: leader,
                session_id: id.to_string(),
                heartbeat_ms,
                hostname: format!("host-{}", id),
                lock_key: lock_key.to_string(),
            }
            .to_tags(),
            status: "passing".to_string(),
        }
    }

    #[test]
    fn test_foreign_entries_filtered() {
        let now = 1_000_000;
        let timeout = Duration::from_secs(6);
        assert!(member_from_entry(&entry("a", false, now, "other/lock", 1), LOCK, now, timeout)
            .is_none());

        let mut short = entry("b", false, now, LOCK, 1);
        short.tags.truncate(3);
        assert!(member_from_entry(&short, LOCK, now, timeout).is_none());

        let (member, stale) =
            member_from_entry(&entry("c", true, now - 1000, LOCK, 1), LOCK, now, timeout).unwrap();
        assert!(member.is_leader);
        assert!(!stale);
        assert_eq!(member.hostname, "host-c");
    }

    #[test]
    fn test_stale_heartbeat_flagged() {
        let now = 1_000_000;
        let (_, stale) = member_from_entry(
            &entry("a", false, now - 7000, LOCK, 1),
            LOCK,
            now,
            Duration::from_secs(6),
        )
        .unwrap();
        assert!(stale);
    }

    async fn register(backend: &MemoryCoordinator, e: &ServiceEntry) {
        backend
            .register_service(&ServiceRegistration {
                id: e.id.clone(),
                name: e.name.clone(),
                address: e.address.clone(),
                port: e.port,
                tags: e.tags.clone(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_member_alive_when_probe_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let backend = Arc::new(MemoryCoordinator::new());
        let old = now_ms() - 60_000;
        register(&backend, &entry("live", true, old, LOCK, live_port)).await;
        register(&backend, &entry("dead", false, old, LOCK, dead_port)).await;
        register(&backend, &entry("fresh", false, now_ms(), LOCK, dead_port)).await;

        let mut config = ClusterConfig::default();
        config.probe_timeout_ms = 500;
        let directory = MemberDirectory::new(backend, &config);
        let members = directory.members().await.unwrap();

        let status = |id: &str| {
            members
                .iter()
                .find(|m| m.service_id == id)
                .map(|m| m.status)
                .unwrap()
        };
        assert_eq!(status("live"), MemberStatus::Online);
        assert_eq!(status("dead"), MemberStatus::Offline);
        assert_eq!(status("fresh"), MemberStatus::Online);

        assert_eq!(directory.leader().await.unwrap().service_id, "live");
    }

    #[tokio::test]
    async fn test_leader_errors() {
        let backend = Arc::new(MemoryCoordinator::new());
        let directory = MemberDirectory::new(backend.clone(), &ClusterConfig::default());
        assert!(matches!(
            directory.leader().await,
            Err(ClusterError::MembersEmpty)
        ));

        register(&backend, &entry("f", false, now_ms(), LOCK, 1)).await;
        assert!(matches!(
            directory.leader().await,
            Err(ClusterError::LeaderNotFound)
        ));
    }
}
