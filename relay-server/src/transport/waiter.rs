//! Request/response correlation by message id

use super::types::{TransportError, TransportResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

struct Pending {
    tx: oneshot::Sender<Bytes>,
    created_at: Instant,
    seq: u64,
}

/// Outstanding requests of one connection, keyed by message id
#[derive(Clone, Default)]
pub struct WaiterTable {
    pending: Arc<Mutex<HashMap<i64, Pending>>>,
    seq: Arc<AtomicU64>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `message_id`, replacing any previous one
    pub fn register(&self, message_id: i64) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.lock().insert(
            message_id,
            Pending {
                tx,
                created_at: Instant::now(),
                seq,
            },
        );
        if previous.is_some() {
            debug!("Replaced stale waiter for message {}", message_id);
        }

        Waiter {
            message_id,
            seq,
            rx,
            table: self.clone(),
        }
    }

    /// Hand a response to the waiter for `message_id`
    ///
    /// Returns false (and drops the payload) when no live waiter exists.
    pub fn deliver(&self, message_id: i64, payload: Bytes) -> bool {
        let pending = self.pending.lock().remove(&message_id);
        match pending {
            Some(pending) => pending.tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Drop waiters older than `max_age`; their callers observe `Closed`
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.created_at.elapsed() <= max_age);
        before - pending.len()
    }

    /// Fail every outstanding waiter with `Closed`
    pub fn close_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_current(&self, message_id: i64, seq: u64) {
        let mut pending = self.pending.lock();
        if pending.get(&message_id).is_some_and(|p| p.seq == seq) {
            pending.remove(&message_id);
        }
    }
}

/// Handle to one pending response
///
/// Dropping the handle removes its table entry.
pub struct Waiter {
    message_id: i64,
    seq: u64,
    rx: oneshot::Receiver<Bytes>,
    table: WaiterTable,
}

impl Waiter {
    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Wait for the correlated response
    pub async fn wait(mut self, timeout: Duration) -> TransportResult<Bytes> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.remove_if_current(self.message_id, self.seq);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("message_id", &self.message_id)
            .finish()
    }
}
