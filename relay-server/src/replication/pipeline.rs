//! Event pipeline - turns reader output into events and checkpoints
//!
//! Rows are numbered from a monotonic event index, wrapped in the JSON event
//! envelope and fanned out to local downstream services, then handed to the
//! position sink for the followers. Position notifications become
//! checkpoint records, persisted before they are pushed.

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::downstream::ServiceRegistry;
use super::reader::ReaderSink;
use super::types::{ReplicationResult, RowEvent, StreamPosition};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Where the leader publishes checkpoints and events
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn publish_checkpoint(&self, checkpoint: &Checkpoint);

    async fn publish_event(&self, topic: &str, payload: &Bytes);
}

/// Row event as delivered downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub database: String,
    pub table: String,
    pub event_type: String,
    /// Unix seconds when the row was relayed
    pub time: i64,
    pub event_index: i64,
    pub event: EventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn topic(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

pub struct EventPipeline {
    store: Arc<CheckpointStore>,
    services: Arc<ServiceRegistry>,
    sink: Arc<dyn PositionSink>,
    event_index: AtomicI64,
}

impl EventPipeline {
    pub fn new(
        store: Arc<CheckpointStore>,
        services: Arc<ServiceRegistry>,
        sink: Arc<dyn PositionSink>,
    ) -> Self {
        Self {
            store,
            services,
            sink,
            event_index: AtomicI64::new(0),
        }
    }

    pub fn event_index(&self) -> i64 {
        self.event_index.load(Ordering::SeqCst)
    }

    /// Load the stored checkpoint ahead of a new leadership term
    ///
    /// The event counter continues from the checkpoint, which on a promoted
    /// follower is the last one pushed by the previous leader.
    pub async fn prepare_resume(&self) -> Option<Checkpoint> {
        let checkpoint = self.store.current().await;
        let index = checkpoint.as_ref().map_or(0, |c| c.event_index);
        self.event_index.store(index, Ordering::SeqCst);
        checkpoint
    }

    fn envelope(&self, event: RowEvent) -> EventEnvelope {
        EventEnvelope {
            database: event.database,
            table: event.table,
            event_type: event.event_type,
            time: chrono::Utc::now().timestamp(),
            event_index: self.event_index.fetch_add(1, Ordering::SeqCst) + 1,
            event: EventBody { data: event.data },
        }
    }
}

#[async_trait]
impl ReaderSink for EventPipeline {
    async fn on_row(&self, event: RowEvent) -> ReplicationResult<()> {
        let envelope = self.envelope(event);
        let topic = envelope.topic();
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);

        self.services.send_all(&topic, &payload).await;
        self.sink.publish_event(&topic, &payload).await;
        Ok(())
    }

    async fn on_position_synced(&self, position: StreamPosition) -> ReplicationResult<()> {
        let checkpoint = Checkpoint::new(position.file_name, position.offset, self.event_index());
        self.store.save(&checkpoint).await?;
        debug!(
            "Checkpoint {}:{} (event index {})",
            checkpoint.file_name, checkpoint.offset, checkpoint.event_index
        );
        self.sink.publish_checkpoint(&checkpoint).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::checkpoint::CHECKPOINT_FILE;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        checkpoints: Mutex<Vec<Checkpoint>>,
        events: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl PositionSink for Recorder {
        async fn publish_checkpoint(&self, checkpoint: &Checkpoint) {
            self.checkpoints.lock().push(checkpoint.clone());
        }

        async fn publish_event(&self, topic: &str, payload: &Bytes) {
            self.events.lock().push((topic.to_string(), payload.clone()));
        }
    }

    fn row(table: &str) -> RowEvent {
        RowEvent {
            database: "shop".to_string(),
            table: table.to_string(),
            event_type: "insert".to_string(),
            data: serde_json::json!({"id": 7}),
        }
    }

    #[tokio::test]
    async fn test_rows_are_numbered_and_checkpointed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            CheckpointStore::open(dir.path().join(CHECKPOINT_FILE))
                .await
                .unwrap(),
        );
        let recorder = Arc::new(Recorder::default());
        let pipeline =
            EventPipeline::new(store.clone(), Arc::new(ServiceRegistry::new()), recorder.clone());

        pipeline.on_row(row("orders")).await.unwrap();
        pipeline.on_row(row("users")).await.unwrap();
        pipeline
            .on_position_synced(StreamPosition::new("log.1", 300))
            .await
            .unwrap();

        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "shop.orders");
        let second: EventEnvelope = serde_json::from_slice(&events[1].1).unwrap();
        assert_eq!(second.event_index, 2);
        assert_eq!(second.event.data["id"], 7);

        let expected = Checkpoint::new("log.1", 300, 2);
        assert_eq!(*recorder.checkpoints.lock(), vec![expected.clone()]);
        assert_eq!(store.current().await, Some(expected));
    }

    #[tokio::test]
    async fn test_resume_continues_event_index() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            CheckpointStore::open(dir.path().join(CHECKPOINT_FILE))
                .await
                .unwrap(),
        );
        store.apply(&Checkpoint::new("log.4", 10, 41)).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let pipeline =
            EventPipeline::new(store, Arc::new(ServiceRegistry::new()), recorder.clone());
        let resume = pipeline.prepare_resume().await.unwrap();
        assert_eq!(resume.position(), StreamPosition::new("log.4", 10));

        pipeline.on_row(row("orders")).await.unwrap();
        let events = recorder.events.lock();
        let envelope: EventEnvelope = serde_json::from_slice(&events[0].1).unwrap();
        assert_eq!(envelope.event_index, 42);
    }
}
