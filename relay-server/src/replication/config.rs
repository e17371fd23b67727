use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Change-stream reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// JSONL file of row changes to tail
    pub source_path: PathBuf,

    /// Delay between polls once the end of the source is reached
    pub poll_interval_ms: u64,

    /// Delay before restarting a reader that failed while leader
    pub retry_interval_ms: u64,

    /// How long a stopping reader may take before it is abandoned
    pub stop_timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("./data/changes.jsonl"),
            poll_interval_ms: 200,
            retry_interval_ms: 3000,
            stop_timeout_ms: 5000,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.source_path.as_os_str().is_empty() {
            return Err("reader.source_path must not be empty".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("reader.poll_interval_ms must be > 0".to_string());
        }
        if self.stop_timeout_ms == 0 {
            return Err("reader.stop_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
