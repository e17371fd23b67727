//! Agent Sync - checkpoint and event handoff between leader and followers
//!
//! Leader side: followers dial the agent listener and identify themselves
//! with an `Agent` envelope. Handshaked connections receive every checkpoint
//! (`Pos`) and row event (`Event`) the leader produces.
//!
//! Follower side: a reconnecting client follows whichever member the
//! registry reports as leader. Received checkpoints are applied to the local
//! cache so a promotion resumes where the old leader stopped; events go to
//! the local downstream services.

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::downstream::ServiceRegistry;
use super::pipeline::{EventEnvelope, PositionSink};
use crate::cluster::{LeadershipObserver, MemberDirectory};
use crate::protocol::{Command, CommandCode, Frame, pack};
use crate::transport::{
    Connection, ConnectionGroup, ConnectionObserver, FrameServer, ReconnectingClient,
    TransportConfig, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub struct AgentSync {
    node_id: String,
    transport: TransportConfig,
    agents: Arc<ConnectionGroup>,
    leader: AtomicBool,
    /// Follower link to the current leader
    link: Mutex<Option<Arc<ReconnectingClient>>>,
    inbound: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl AgentSync {
    pub fn new(
        node_id: impl Into<String>,
        transport: TransportConfig,
        store: Arc<CheckpointStore>,
        services: Arc<ServiceRegistry>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (inbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(apply_loop(rx, store, services, shutdown.clone()));

        Arc::new(Self {
            node_id: node_id.into(),
            transport,
            agents: ConnectionGroup::new("agents"),
            leader: AtomicBool::new(false),
            link: Mutex::new(None),
            inbound,
            shutdown: shutdown.clone(),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Handshaked follower connections
    pub fn agents(&self) -> &Arc<ConnectionGroup> {
        &self.agents
    }

    /// Address of the leader currently followed
    pub fn following(&self) -> Option<String> {
        self.link.lock().as_ref().map(|c| c.addr().to_string())
    }

    /// Bind the agent listener
    pub async fn listen(&self, addr: &str) -> TransportResult<FrameServer> {
        let observers: Vec<Arc<dyn ConnectionObserver>> = vec![
            self.agents.clone(),
            Arc::new(HandshakeObserver {
                agents: Arc::clone(&self.agents),
            }),
        ];
        FrameServer::bind("agent listener", addr, self.transport.clone(), observers).await
    }

    /// Keep following the registry's leader until shutdown
    pub fn follow(
        self: &Arc<Self>,
        directory: Arc<MemberDirectory>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).follow_loop(directory, interval))
    }

    async fn follow_loop(self: Arc<Self>, directory: Arc<MemberDirectory>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.is_leader() {
                self.drop_link();
                continue;
            }

            match directory.leader().await {
                Ok(leader) if leader.session_id == self.node_id => self.drop_link(),
                Ok(leader) => self.ensure_link(&leader.address()),
                Err(e) => debug!("No leader to follow: {}", e),
            }
        }
        self.drop_link();
    }

    /// Follow `addr`, replacing a link to any other address
    pub fn ensure_link(&self, addr: &str) {
        let replaced = {
            let mut link = self.link.lock();
            if link
                .as_ref()
                .is_some_and(|c| c.addr() == addr && !c.is_stopped())
            {
                return;
            }

            let observers: Vec<Arc<dyn ConnectionObserver>> = vec![Arc::new(FollowerObserver {
                node_id: self.node_id.clone(),
                inbound: self.inbound.clone(),
            })];
            let client =
                ReconnectingClient::new(addr, self.transport.clone(), observers, &self.shutdown);
            client.start();
            info!("Following leader at {}", addr);
            link.replace(client)
        };

        if let Some(old) = replaced {
            old.stop();
        }
    }

    fn drop_link(&self) {
        let current = self.link.lock().take();
        if let Some(client) = current {
            info!("Stopped following {}", client.addr());
            client.stop();
        }
    }
}

#[async_trait]
impl PositionSink for AgentSync {
    async fn publish_checkpoint(&self, checkpoint: &Checkpoint) {
        if !self.is_leader() {
            return;
        }
        let payload = pack(CommandCode::Pos, &checkpoint.encode());
        let delivered = self.agents.broadcast(payload).await;
        trace!(
            "Checkpoint {}:{} pushed to {} followers",
            checkpoint.file_name, checkpoint.offset, delivered
        );
    }

    async fn publish_event(&self, _topic: &str, payload: &Bytes) {
        if !self.is_leader() {
            return;
        }
        self.agents.broadcast(pack(CommandCode::Event, payload)).await;
    }
}

impl LeadershipObserver for AgentSync {
    fn on_leadership_change(&self, is_leader: bool) {
        let was_leader = self.leader.swap(is_leader, Ordering::SeqCst);
        if is_leader {
            self.drop_link();
        } else if was_leader {
            // Followers re-dial whoever wins next
            info!("Demoted, dropping {} follower connections", self.agents.len());
            self.agents.close_all();
        }
    }
}

/// Leader side: admits connections that identify as agents
struct HandshakeObserver {
    agents: Arc<ConnectionGroup>,
}

impl ConnectionObserver for HandshakeObserver {
    fn on_message(&self, conn: &Arc<Connection>, frame: &Frame) {
        match Command::decode(&frame.payload) {
            Ok(command) if command.code == CommandCode::Agent => {
                info!(
                    "Agent {} connected from {}",
                    command.body_str(),
                    conn.peer_addr()
                );
                self.agents.add(conn);
            }
            Ok(command) if command.code == CommandCode::Tick => {}
            Ok(command) => debug!(
                "Ignoring {} from agent connection {}",
                command.code,
                conn.id()
            ),
            Err(e) => warn!("Bad envelope from agent connection {}: {}", conn.id(), e),
        }
    }
}

/// Follower side: handshake on connect, queue inbound envelopes in order
struct FollowerObserver {
    node_id: String,
    inbound: mpsc::UnboundedSender<Command>,
}

impl ConnectionObserver for FollowerObserver {
    fn on_connect(&self, conn: &Arc<Connection>) {
        let conn = Arc::clone(conn);
        let handshake = pack(CommandCode::Agent, self.node_id.as_bytes());
        tokio::spawn(async move {
            if let Err(e) = conn.write(handshake).await {
                warn!("Agent handshake to {} failed: {}", conn.peer_addr(), e);
            }
        });
    }

    fn on_message(&self, conn: &Arc<Connection>, frame: &Frame) {
        match Command::decode(&frame.payload) {
            Ok(command) => {
                if self.inbound.send(command).is_err() {
                    debug!("Inbound queue closed, dropping frame from {}", conn.id());
                }
            }
            Err(e) => warn!("Bad envelope from leader {}: {}", conn.peer_addr(), e),
        }
    }
}

async fn apply_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    store: Arc<CheckpointStore>,
    services: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command.code {
            CommandCode::Pos => match Checkpoint::decode(&command.body) {
                Ok(checkpoint) => match store.apply(&checkpoint).await {
                    Ok(true) => debug!(
                        "Applied checkpoint {}:{} (event index {})",
                        checkpoint.file_name, checkpoint.offset, checkpoint.event_index
                    ),
                    Ok(false) => {}
                    Err(e) => warn!("Cannot apply checkpoint: {}", e),
                },
                Err(e) => warn!("Dropping bad checkpoint from leader: {}", e),
            },
            CommandCode::Event => match serde_json::from_slice::<EventEnvelope>(&command.body) {
                Ok(envelope) => {
                    services.send_all(&envelope.topic(), &command.body).await;
                }
                Err(e) => warn!("Dropping bad event from leader: {}", e),
            },
            CommandCode::Tick => {}
            _ => {
                services.send_raw(&command.encode()).await;
            }
        }
    }
    debug!("Agent apply loop stopped");
}
