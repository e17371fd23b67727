//! Operator control channel
//!
//! A frame-protocol listener whose payloads are command envelopes:
//! `Stop`, `Reload <service|all>`, `ShowMembers` and `Tick`. Replies reuse
//! the request's message id; unsupported codes get an `Error` envelope.

pub mod render;
pub mod server;

pub use render::render_members;
pub use server::{ControlHandler, ControlReply, REPLY_OK, bind, dispatch};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:9596".to_string(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.listen.trim().is_empty() {
            return Err("control.listen must be set when control is enabled".to_string());
        }
        Ok(())
    }
}
