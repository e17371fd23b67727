use crate::protocol::{Command, CommandCode, Frame, pack};
use crate::transport::{Connection, ConnectionObserver, FrameServer, TransportConfig, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Body of a successful `Stop`/`Reload`/`Tick` reply
pub const REPLY_OK: &[u8] = b"ok";

/// Operations the control listener exposes
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Begin process shutdown
    async fn stop(&self);

    /// Reload configuration and the downstream service named `target`
    /// (`all` for every service)
    async fn reload(&self, target: &str) -> Result<(), String>;

    async fn show_members(&self) -> String;
}

/// Outcome of one control request
pub struct ControlReply {
    pub payload: Bytes,
    /// Shut down once the reply is queued
    pub stop: bool,
}

/// Handle one control envelope
pub async fn dispatch(handler: &dyn ControlHandler, payload: &[u8]) -> ControlReply {
    let command = match Command::decode(payload) {
        Ok(command) => command,
        Err(e) => {
            return ControlReply {
                payload: pack(CommandCode::Error, e.to_string().as_bytes()),
                stop: false,
            };
        }
    };

    let reply = |code, body: &[u8]| ControlReply {
        payload: pack(code, body),
        stop: false,
    };

    match command.code {
        CommandCode::Tick => reply(CommandCode::Tick, REPLY_OK),
        CommandCode::Stop => {
            info!("Stop requested over control connection");
            ControlReply {
                payload: pack(CommandCode::Stop, REPLY_OK),
                stop: true,
            }
        }
        CommandCode::Reload => {
            let target = command.body_str();
            info!("Reload of {} requested", target);
            match handler.reload(&target).await {
                Ok(()) => reply(CommandCode::Reload, REPLY_OK),
                Err(e) => {
                    warn!("Reload of {} failed: {}", target, e);
                    reply(CommandCode::Error, e.as_bytes())
                }
            }
        }
        CommandCode::ShowMembers => {
            let table = handler.show_members().await;
            reply(CommandCode::ShowMembers, table.as_bytes())
        }
        other => reply(
            CommandCode::Error,
            format!("unsupported command: {}", other).as_bytes(),
        ),
    }
}

/// Bind the control listener
pub async fn bind(
    addr: &str,
    config: TransportConfig,
    handler: Arc<dyn ControlHandler>,
) -> TransportResult<FrameServer> {
    let observers: Vec<Arc<dyn ConnectionObserver>> = vec![Arc::new(ControlObserver { handler })];
    FrameServer::bind("control listener", addr, config, observers).await
}

struct ControlObserver {
    handler: Arc<dyn ControlHandler>,
}

impl ConnectionObserver for ControlObserver {
    fn on_message(&self, conn: &Arc<Connection>, frame: &Frame) {
        let conn = Arc::clone(conn);
        let handler = Arc::clone(&self.handler);
        let message_id = frame.message_id;
        let payload = frame.payload.clone();

        tokio::spawn(async move {
            let reply = dispatch(handler.as_ref(), &payload).await;
            if let Err(e) = conn.respond(message_id, reply.payload).await {
                debug!("Control reply to {} dropped: {}", conn.peer_addr(), e);
            }
            if reply.stop {
                handler.stop().await;
            }
        });
    }
}
