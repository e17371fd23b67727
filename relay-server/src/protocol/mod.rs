//! Cluster wire protocol
//!
//! - `frame`: length-prefixed frames with a resync marker
//! - `command`: control/replication command envelope carried in frame payloads

pub mod command;
pub mod frame;

pub use command::{Command, CommandCode, CommandError, CommandResult, pack};
pub use frame::{
    DEFAULT_MAX_FRAME_LEN, Decoded, FIRST_USER_ID, Frame, FrameError, FrameResult, KEEPALIVE_ID,
    RESERVED_ID_MAX, decode, encode,
};
