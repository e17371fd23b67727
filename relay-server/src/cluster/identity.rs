use super::types::ClusterResult;
use std::path::Path;
use tracing::info;

/// File under the data dir holding the node's stable id
pub const SESSION_FILE: &str = "session";

/// Who this node is in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Stable id; registry service id and self-detection key
    pub node_id: String,
    pub hostname: String,
    /// Address peers use to reach the agent listener
    pub service_ip: String,
    pub port: u16,
}

impl NodeIdentity {
    /// Load the id from `<data_dir>/session`, creating it on first start
    pub fn load_or_create(
        data_dir: &Path,
        hostname: Option<&str>,
        service_ip: &str,
        port: u16,
    ) -> ClusterResult<Self> {
        let node_id = load_or_create_key(&data_dir.join(SESSION_FILE))?;
        Ok(Self {
            node_id,
            hostname: hostname
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .unwrap_or_else(local_hostname),
            service_ip: service_ip.to_string(),
            port,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.service_ip, self.port)
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}:{})", self.hostname, self.service_ip, self.port)
    }
}

fn load_or_create_key(path: &Path) -> ClusterResult<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = format!(
        "{}-{}",
        chrono::Utc::now().timestamp(),
        uuid::Uuid::new_v4()
    );
    std::fs::write(path, &key)?;
    info!("Generated node id {} at {}", key, path.display());
    Ok(key)
}

fn local_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
