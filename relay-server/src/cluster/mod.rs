//! Cluster coordination
//!
//! Leader election over a shared lock/lease service:
//! - `Coordinator` backends: Consul HTTP API and an in-process implementation
//! - `Membership`: session lease, lock acquisition, registry heartbeat,
//!   split-brain safety check
//! - `FailoverWatch`: registry long-poll that re-elects when the leader goes
//! - `MemberDirectory`: member list with online/offline status

pub mod config;
pub mod consul;
pub mod coordinator;
pub mod directory;
pub mod failover;
pub mod identity;
pub mod memory;
pub mod membership;
pub mod types;

pub use config::{BackendKind, ClusterConfig, MIN_SESSION_TTL};
pub use consul::ConsulCoordinator;
pub use coordinator::Coordinator;
pub use directory::MemberDirectory;
pub use failover::FailoverWatch;
pub use identity::NodeIdentity;
pub use memory::MemoryCoordinator;
pub use membership::Membership;
pub use types::{
    ClusterError, ClusterMember, ClusterResult, LeadershipObserver, MemberStatus, MemberTags,
    ServiceEntry, ServiceRegistration,
};

use std::sync::Arc;

/// Build the configured coordination backend
pub fn build_coordinator(config: &ClusterConfig) -> ClusterResult<Arc<dyn Coordinator>> {
    Ok(match config.backend {
        BackendKind::Consul => Arc::new(
            ConsulCoordinator::new(&config.consul_address)?.with_check_ttl(config.check_ttl()),
        ),
        BackendKind::Memory => Arc::new(MemoryCoordinator::new()),
    })
}
