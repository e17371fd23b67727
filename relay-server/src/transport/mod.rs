//! Connection engine for the cluster wire protocol
//!
//! Provides:
//! - `Connection`: framed socket with reader/writer/keepalive tasks
//! - `WaiterTable`: request/response correlation by message id
//! - `FrameServer` / `ReconnectingClient`: accepting and dialing sides
//! - `ConnectionGroup`: live connection sets with broadcast

pub mod client;
pub mod config;
pub mod connection;
pub mod group;
pub mod server;
pub mod types;
pub mod waiter;

pub use client::{ReconnectingClient, connect};
pub use config::TransportConfig;
pub use connection::Connection;
pub use group::ConnectionGroup;
pub use server::FrameServer;
pub use types::{
    ConnectionObserver, ConnectionState, MessageIdAllocator, TransportError, TransportResult,
};
pub use waiter::{Waiter, WaiterTable};
