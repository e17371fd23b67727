use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of the change-stream reader on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderStatus {
    /// Not tailing (follower, or between leadership terms)
    #[default]
    Stopped,
    /// Tailing the source and publishing checkpoints
    Running,
}

impl std::fmt::Display for ReaderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderStatus::Stopped => write!(f, "stopped"),
            ReaderStatus::Running => write!(f, "running"),
        }
    }
}

/// Position in the upstream change log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub file_name: String,
    pub offset: u32,
}

impl StreamPosition {
    pub fn new(file_name: impl Into<String>, offset: u32) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
        }
    }
}

/// One decoded row change from the upstream stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub database: String,
    pub table: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RowEvent {
    /// Routing topic for downstream services
    pub fn topic(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("Checkpoint checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Stream reader error: {0}")]
    Reader(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Downstream service error: {0}")]
    Service(String),

    #[error("Checkpoint store closed")]
    Closed,
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic() {
        let event = RowEvent {
            database: "shop".to_string(),
            table: "orders".to_string(),
            event_type: "insert".to_string(),
            data: serde_json::Value::Null,
        };
        assert_eq!(event.topic(), "shop.orders");
    }

    #[test]
    fn test_row_event_without_data() {
        let event: RowEvent =
            serde_json::from_str(r#"{"database":"d","table":"t","event_type":"delete"}"#).unwrap();
        assert!(event.data.is_null());
        assert_eq!(event.event_type, "delete");
    }
}
