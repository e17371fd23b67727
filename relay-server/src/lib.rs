pub mod cluster;
pub mod config;
pub mod control;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod transport;

// Re-export commonly used types
pub use cluster::{
    BackendKind, ClusterConfig, ClusterError, ClusterMember, Coordinator, LeadershipObserver,
    MemberStatus, Membership, MemoryCoordinator, NodeIdentity,
};
pub use config::{LoggingConfig, NodeConfig, RelayConfig};
pub use control::{ControlConfig, ControlHandler, render_members};
pub use node::RelayNode;
pub use protocol::{Command, CommandCode, Frame, FrameError, pack};
pub use replication::{
    Checkpoint, CheckpointStore, DownstreamService, EventEnvelope, JsonlReaderFactory,
    LogService, ReaderConfig, ReaderStatus, ReplicationError, ReplicationResult, RowEvent,
    ServiceRegistry, StreamPosition, StreamReader, StreamReaderFactory,
};
pub use transport::{
    Connection, ConnectionObserver, ReconnectingClient, TransportConfig, TransportError,
};
