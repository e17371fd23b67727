use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound the coordination backend accepts for session TTLs
pub const MIN_SESSION_TTL: Duration = Duration::from_secs(10);

/// Coordination backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Consul HTTP API
    #[default]
    Consul,
    /// In-process backend (single process clusters, tests)
    Memory,
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Enable leader election; when disabled the node always leads
    pub enabled: bool,

    pub backend: BackendKind,

    /// Consul agent address (host:port)
    pub consul_address: String,

    /// Registry service name shared by all relay nodes
    pub service_name: String,

    /// KV key whose holder is the leader; also tags the cluster
    pub lock_key: String,

    /// Session TTL in milliseconds (backends clamp to their minimum)
    pub session_ttl_ms: u64,

    /// TTL of the registry health check the heartbeat keeps passing
    pub check_ttl_ms: u64,

    /// Session renewal and heartbeat re-registration interval
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age after which a member is probed for liveness
    pub keepalive_timeout_ms: u64,

    /// Lock acquisition poll interval
    pub election_interval_ms: u64,

    /// Leader count / offline member check interval
    pub check_interval_ms: u64,

    /// TCP liveness probe timeout
    pub probe_timeout_ms: u64,

    /// Long-poll wait of the failover watch
    pub watch_wait_ms: u64,

    /// Force-delete attempts when the leader entry disappears
    pub force_delete_attempts: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Consul,
            consul_address: "127.0.0.1:8500".to_string(),
            service_name: "relay".to_string(),
            lock_key: "relay/leader".to_string(),
            session_ttl_ms: 10000,       // 10 seconds
            check_ttl_ms: 10000,
            heartbeat_interval_ms: 1000, // 1 second
            keepalive_timeout_ms: 6000,  // 6 seconds
            election_interval_ms: 3000,  // 3 seconds
            check_interval_ms: 1000,
            probe_timeout_ms: 3000,
            watch_wait_ms: 30000,
            force_delete_attempts: 3,
        }
    }
}

impl ClusterConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.lock_key.trim().is_empty() {
            return Err("cluster.lock_key must not be empty".to_string());
        }
        if self.service_name.trim().is_empty() {
            return Err("cluster.service_name must not be empty".to_string());
        }
        if self.backend == BackendKind::Consul && self.consul_address.trim().is_empty() {
            return Err("cluster.consul_address is required for the consul backend".to_string());
        }
        if self.session_ttl_ms == 0 {
            return Err("cluster.session_ttl_ms must be greater than 0".to_string());
        }
        if self.heartbeat_interval_ms == 0
            || self.election_interval_ms == 0
            || self.check_interval_ms == 0
        {
            return Err("cluster intervals must be greater than 0".to_string());
        }
        if self.heartbeat_interval_ms >= self.keepalive_timeout_ms {
            return Err(format!(
                "cluster.heartbeat_interval_ms ({}) must be below keepalive_timeout_ms ({})",
                self.heartbeat_interval_ms, self.keepalive_timeout_ms
            ));
        }
        if self.check_ttl_ms <= self.heartbeat_interval_ms {
            return Err("cluster.check_ttl_ms must exceed heartbeat_interval_ms".to_string());
        }
        if self.force_delete_attempts == 0 {
            return Err("cluster.force_delete_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn check_ttl(&self) -> Duration {
        Duration::from_millis(self.check_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn watch_wait(&self) -> Duration {
        Duration::from_millis(self.watch_wait_ms)
    }
}
