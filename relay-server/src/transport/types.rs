use super::connection::Connection;
use crate::protocol::{FIRST_USER_ID, Frame, FrameError};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Transport error types
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection is not connected")]
    NotConnected,

    #[error("Timed out waiting for response")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Receives connection events
///
/// Observers are invoked synchronously from the connection's reader task in
/// registration order. They must not block and must not call back into the
/// connection synchronously; spawn a task for anything that awaits.
pub trait ConnectionObserver: Send + Sync {
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// Called for every decoded non-keepalive frame
    fn on_message(&self, _conn: &Arc<Connection>, _frame: &Frame) {}

    fn on_close(&self, _conn: &Arc<Connection>) {}
}

/// Per-connection message id counter
///
/// Starts at the first user id and wraps from `i64::MAX` back to it, so the
/// reserved system ids are never handed out.
#[derive(Debug)]
pub struct MessageIdAllocator {
    next: AtomicI64,
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_USER_ID)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first.max(FIRST_USER_ID)),
        }
    }

    pub fn next_id(&self) -> i64 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current == i64::MAX {
                FIRST_USER_ID
            } else {
                current + 1
            };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
