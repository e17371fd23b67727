use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of tags every relay registry entry carries
pub const MEMBER_TAG_COUNT: usize = 5;

/// Member liveness as seen by peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Online,
    Offline,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Cluster member derived from one registry entry
///
/// Recomputed on every query, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub service_id: String,
    pub hostname: String,
    pub service_ip: String,
    pub port: u16,
    pub is_leader: bool,
    pub status: MemberStatus,
    pub session_id: String,
}

impl ClusterMember {
    pub fn is_online(&self) -> bool {
        self.status == MemberStatus::Online
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.service_ip, self.port)
    }
}

/// Tags a node publishes on its registry entry
///
/// Wire order: `[leader "1"/"0", session id, heartbeat ms, hostname, lock key]`.
/// The lock key doubles as the cluster identifier so unrelated services on
/// the same backend are filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberTags {
    pub is_leader: bool,
    pub session_id: String,
    pub heartbeat_ms: u64,
    pub hostname: String,
    pub lock_key: String,
}

impl MemberTags {
    pub fn to_tags(&self) -> Vec<String> {
        vec![
            if self.is_leader { "1" } else { "0" }.to_string(),
            self.session_id.clone(),
            self.heartbeat_ms.to_string(),
            self.hostname.clone(),
            self.lock_key.clone(),
        ]
    }

    /// Parse tags; `None` for entries that are not relay members
    pub fn from_tags(tags: &[String]) -> Option<Self> {
        if tags.len() < MEMBER_TAG_COUNT {
            return None;
        }
        Some(Self {
            is_leader: tags[0] == "1",
            session_id: tags[1].clone(),
            heartbeat_ms: tags[2].parse().unwrap_or(0),
            hostname: tags[3].clone(),
            lock_key: tags[4].clone(),
        })
    }

    /// Leader bit only, for entries of any shape
    pub fn leader_flag(tags: &[String]) -> bool {
        tags.first().is_some_and(|t| t == "1")
    }
}

/// Service registration sent to the coordination backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

/// Health status string reported for passing entries
pub const HEALTH_PASSING: &str = "passing";

/// Raw registry entry as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    /// Aggregated health status ("passing", "warning", "critical")
    pub status: String,
}

/// Receives leadership transitions
///
/// Called synchronously from the election loop, in registration order.
/// Implementations must return quickly and never call back into the
/// membership service from the callback.
pub trait LeadershipObserver: Send + Sync {
    fn on_leadership_change(&self, is_leader: bool);
}

/// Cluster error types
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Coordination session is empty")]
    SessionEmpty,

    #[error("Coordination session invalid: {0}")]
    InvalidSession(String),

    #[error("Coordination backend error: {0}")]
    Backend(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Leader not found")]
    LeaderNotFound,

    #[error("Cluster members empty")]
    MembersEmpty,

    #[error("Service not registered")]
    NotRegistered,
}

impl ClusterError {
    /// Whether recovering requires a fresh session
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::SessionEmpty | Self::InvalidSession(_))
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
