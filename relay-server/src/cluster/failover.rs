//! Failover Watch - react to leader entries leaving or failing
//!
//! Long-polls the registry and diffs each snapshot against the previous one:
//! - deleted entries
//! - entries whose health status changed (recoveries to passing ignored)
//! - added entries (logged only)
//!
//! When a foreign entry tagged leader is affected, the lock is force-deleted
//! and an election round is triggered.

use super::membership::Membership;
use super::types::{HEALTH_PASSING, MemberTags, ServiceEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Entries of `previous` missing from `current`
pub fn deleted_entries<'a>(
    previous: &'a [ServiceEntry],
    current: &[ServiceEntry],
) -> Vec<&'a ServiceEntry> {
    let current: HashMap<&str, &ServiceEntry> =
        current.iter().map(|e| (e.id.as_str(), e)).collect();
    previous
        .iter()
        .filter(|e| !current.contains_key(e.id.as_str()))
        .collect()
}

/// Entries present in both whose health status differs (current version)
pub fn changed_entries<'a>(
    previous: &[ServiceEntry],
    current: &'a [ServiceEntry],
) -> Vec<&'a ServiceEntry> {
    let previous: HashMap<&str, &ServiceEntry> =
        previous.iter().map(|e| (e.id.as_str(), e)).collect();
    current
        .iter()
        .filter(|e| {
            previous
                .get(e.id.as_str())
                .is_some_and(|before| before.status != e.status)
        })
        .collect()
}

/// Entries of `current` missing from `previous`
pub fn added_entries<'a>(
    previous: &[ServiceEntry],
    current: &'a [ServiceEntry],
) -> Vec<&'a ServiceEntry> {
    deleted_entries(current, previous)
}

/// Registry long-poll loop driving re-election
pub struct FailoverWatch {
    membership: Arc<Membership>,
    wait: Duration,
    retry: Duration,
    force_delete_attempts: u32,
}

impl FailoverWatch {
    pub fn new(membership: Arc<Membership>, wait: Duration, force_delete_attempts: u32) -> Self {
        Self {
            membership,
            wait,
            retry: Duration::from_secs(1),
            force_delete_attempts: force_delete_attempts.max(1),
        }
    }

    /// Delay before retrying a failed or empty query
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn start(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let backend = Arc::clone(self.membership.directory().backend());
        let service_name = self.membership.directory().service_name().to_string();
        let self_id = self.membership.identity().node_id.clone();

        let mut snapshot: Option<Vec<ServiceEntry>> = None;
        let mut index = 0u64;

        loop {
            let query = async {
                match &snapshot {
                    None => backend.services(&service_name).await.map(|e| (e, index)),
                    Some(_) => {
                        backend
                            .watch_services(&service_name, index, self.wait)
                            .await
                    }
                }
            };

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = query => result,
            };

            let (entries, new_index) = match result {
                Ok(found) => found,
                Err(e) => {
                    error!("Registry watch failed: {}", e);
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match snapshot.take() {
                None => {
                    if entries.is_empty() {
                        debug!("Registry empty, waiting for members");
                        if self.pause(&shutdown).await {
                            break;
                        }
                        continue;
                    }
                    // First sighting of ourselves seeds the first election
                    if entries.iter().any(|e| e.id == self_id) {
                        debug!("Own entry registered, triggering election");
                        self.membership.trigger_election();
                    }
                }
                Some(previous) => {
                    self.process(&previous, &entries, &self_id).await;
                }
            }

            // The index may go backwards after a backend restart
            index = if new_index < index { 0 } else { new_index };
            snapshot = Some(entries);
        }

        debug!("Failover watch stopped");
    }

    /// True for the leader entry of this cluster, other than ourselves.
    /// Entries of other clusters sharing the service name are ignored.
    fn is_peer_leader(&self, entry: &ServiceEntry, self_id: &str) -> bool {
        entry.id != self_id
            && MemberTags::from_tags(&entry.tags).is_some_and(|tags| {
                tags.is_leader && tags.lock_key == self.membership.lock_key()
            })
    }

    async fn process(&self, previous: &[ServiceEntry], current: &[ServiceEntry], self_id: &str) {
        let mut leader_lost = false;

        for entry in deleted_entries(previous, current) {
            if self.is_peer_leader(entry, self_id) {
                warn!("Leader entry {} was removed", entry.id);
                leader_lost = true;
            }
        }

        for entry in changed_entries(previous, current) {
            if entry.status == HEALTH_PASSING {
                continue;
            }
            if self.is_peer_leader(entry, self_id) {
                warn!("Leader entry {} is now {}", entry.id, entry.status);
                leader_lost = true;
            }
        }

        for entry in added_entries(previous, current) {
            debug!("Member {} joined", entry.id);
        }

        if leader_lost {
            self.force_unlock().await;
            self.membership.trigger_election();
        }
    }

    async fn force_unlock(&self) {
        let key = self.membership.lock_key().to_string();
        for attempt in 1..=self.force_delete_attempts {
            match self.membership.force_delete(&key).await {
                Ok(()) => {
                    info!("Cleared lock {} after leader loss", key);
                    return;
                }
                Err(e) => warn!(
                    "Clearing lock {} failed (attempt {}/{}): {}",
                    key, attempt, self.force_delete_attempts, e
                ),
            }
        }
    }

    /// Sleep for the retry delay; true when shutdown fired meanwhile
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.retry) => false,
        }
    }
}
