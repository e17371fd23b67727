use super::types::{ReplicationResult, RowEvent, StreamPosition};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives what a stream reader decodes
///
/// Calls arrive in stream order from the reader's task.
#[async_trait]
pub trait ReaderSink: Send + Sync {
    async fn on_row(&self, event: RowEvent) -> ReplicationResult<()>;

    /// The reader has durably consumed everything up to `position`
    async fn on_position_synced(&self, position: StreamPosition) -> ReplicationResult<()>;
}

/// Upstream change-stream reader
///
/// A reader is single use: once `close` has been called (or `run_from` has
/// returned) a new one must be created.
#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Tail the stream from `start` (or its beginning), blocking until
    /// closed or failed
    async fn run_from(
        &self,
        start: Option<StreamPosition>,
        sink: Arc<dyn ReaderSink>,
    ) -> ReplicationResult<()>;

    /// Make a running `run_from` return
    fn close(&self);
}

/// Creates fresh readers for each leadership term
pub trait StreamReaderFactory: Send + Sync {
    fn create(&self) -> ReplicationResult<Arc<dyn StreamReader>>;
}
