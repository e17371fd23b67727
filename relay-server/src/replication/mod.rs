/// Replication module - checkpoint handoff between leader and followers
///
/// Only the leader tails the upstream change stream:
/// - Every position the reader reaches becomes a checkpoint record,
///   persisted locally before it is pushed to the followers
/// - Row events are numbered, fanned out to downstream services and pushed
/// - Followers apply checkpoints idempotently so a promoted follower
///   resumes where the old leader stopped
/// - Reader start/stop follows leadership through one control path
pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod downstream;
pub mod pipeline;
pub mod reader;
pub mod tail;
pub mod types;

pub use agent::AgentSync;
pub use checkpoint::{CHECKPOINT_FILE, Checkpoint, CheckpointStore};
pub use config::ReaderConfig;
pub use controller::ReaderController;
pub use downstream::{DownstreamService, LogService, RELOAD_ALL, ServiceRegistry};
pub use pipeline::{EventBody, EventEnvelope, EventPipeline, PositionSink};
pub use reader::{ReaderSink, StreamReader, StreamReaderFactory};
pub use tail::{JsonlReaderFactory, JsonlTailReader};
pub use types::{ReaderStatus, ReplicationError, ReplicationResult, RowEvent, StreamPosition};
