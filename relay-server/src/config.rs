use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cluster::ClusterConfig;
use crate::control::ControlConfig;
use crate::replication::ReaderConfig;
use crate::transport::TransportConfig;

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub transport: TransportConfig,
    pub control: ControlConfig,
    pub reader: ReaderConfig,
    pub logging: LoggingConfig,

    /// File this value was loaded from
    #[serde(skip)]
    source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname shown to other members; the machine hostname when unset
    pub name: Option<String>,

    /// Address peers use to reach this node's agent listener
    pub service_ip: String,

    pub agent_listen: String,

    /// Holds the checkpoint cache and the session identity file
    pub data_dir: PathBuf,

    /// How often a follower looks up the leader to follow
    pub follow_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            service_ip: "127.0.0.1".to_string(),
            agent_listen: "0.0.0.0:9595".to_string(),
            data_dir: PathBuf::from("./data"),
            follow_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn follow_interval(&self) -> Duration {
        Duration::from_millis(self.follow_interval_ms)
    }
}

impl RelayConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Re-read the file this value came from
    ///
    /// Returns a new value; a default configuration reloads to itself.
    pub fn reload(&self) -> anyhow::Result<Self> {
        match &self.source {
            Some(path) => Self::from_file(path),
            None => Ok(self.clone()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let checks = [
            self.cluster.validate(),
            self.transport.validate(),
            self.control.validate(),
            self.reader.validate(),
        ];
        for check in checks {
            if let Err(e) = check {
                bail!("invalid configuration: {}", e);
            }
        }

        if self.node.agent_listen.trim().is_empty() {
            bail!("invalid configuration: node.agent_listen must be set");
        }
        if self.node.follow_interval_ms == 0 {
            bail!("invalid configuration: node.follow_interval_ms must be > 0");
        }
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            bail!(
                "invalid configuration: logging.format must be json or text, got {}",
                self.logging.format
            );
        }
        Ok(())
    }
}
