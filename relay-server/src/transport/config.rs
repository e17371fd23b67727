use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bounded outbound queue capacity (frames)
    pub outbound_queue_capacity: usize,

    /// Keepalive frame interval in milliseconds
    pub keepalive_interval_ms: u64,

    /// Default wait for a correlated response; also the waiter sweep age
    pub waiter_timeout_ms: u64,

    /// Interval of the stale waiter sweep in milliseconds
    pub waiter_sweep_interval_ms: u64,

    /// Read timeout in milliseconds (0 = none)
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds (0 = none)
    pub write_timeout_ms: u64,

    /// Dial timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Largest accepted content length
    pub max_frame_len: usize,

    /// Bytes reserved per socket read
    pub read_buffer_size: usize,

    /// Initial reconnect delay in milliseconds (client side)
    pub reconnect_backoff_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    pub reconnect_backoff_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            keepalive_interval_ms: 3000,    // 3 seconds
            waiter_timeout_ms: 6000,        // 6 seconds
            waiter_sweep_interval_ms: 3000, // 3 seconds
            read_timeout_ms: 10000,         // ~3 missed keepalives
            write_timeout_ms: 3000,
            connect_timeout_ms: 3000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: 4096,
            reconnect_backoff_ms: 1000,
            reconnect_backoff_max_ms: 10000,
        }
    }
}

impl TransportConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.outbound_queue_capacity == 0 {
            return Err("outbound_queue_capacity must be greater than 0".to_string());
        }
        if self.keepalive_interval_ms == 0 || self.waiter_sweep_interval_ms == 0 {
            return Err("keepalive and sweep intervals must be greater than 0".to_string());
        }
        if self.waiter_timeout_ms == 0 {
            return Err("waiter_timeout_ms must be greater than 0".to_string());
        }
        if self.read_timeout_ms != 0 && self.read_timeout_ms <= self.keepalive_interval_ms {
            return Err(format!(
                "read_timeout_ms ({}) must exceed keepalive_interval_ms ({})",
                self.read_timeout_ms, self.keepalive_interval_ms
            ));
        }
        if self.max_frame_len < 8 {
            return Err("max_frame_len must hold at least the message id".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be greater than 0".to_string());
        }
        if self.reconnect_backoff_ms == 0 || self.reconnect_backoff_max_ms < self.reconnect_backoff_ms
        {
            return Err("reconnect backoff must be positive and max >= initial".to_string());
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_millis(self.waiter_timeout_ms)
    }

    pub fn waiter_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.waiter_sweep_interval_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}
