//! Relay node - wires the components together
//!
//! Start order:
//! 1. checkpoint cache, downstream services, stream source (all fatal)
//! 2. agent listener, which fixes the port published in the registry
//! 3. reader controller and agent sync, both leadership observers
//! 4. cluster membership and failover watch, or permanent leadership when
//!    clustering is disabled
//! 5. control listener

use crate::cluster::{
    ClusterMember, Coordinator, FailoverWatch, LeadershipObserver, MemberStatus, Membership,
    NodeIdentity, build_coordinator,
};
use crate::config::RelayConfig;
use crate::control::{self, ControlHandler, render_members};
use crate::replication::{
    AgentSync, CHECKPOINT_FILE, CheckpointStore, EventPipeline, ReaderController, ReaderStatus,
    ServiceRegistry, StreamReaderFactory,
};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct RelayNode {
    config: RwLock<Arc<RelayConfig>>,
    identity: NodeIdentity,
    store: Arc<CheckpointStore>,
    services: Arc<ServiceRegistry>,
    controller: Arc<ReaderController>,
    agent: Arc<AgentSync>,
    membership: Option<Arc<Membership>>,
    agent_addr: SocketAddr,
    control_addr: RwLock<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl RelayNode {
    /// Start a node with the configured coordination backend
    pub async fn start(
        config: RelayConfig,
        factory: Arc<dyn StreamReaderFactory>,
        services: Arc<ServiceRegistry>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        Self::start_with(config, factory, services, None, shutdown).await
    }

    /// Start a node, optionally sharing an existing coordination backend
    pub async fn start_with(
        config: RelayConfig,
        factory: Arc<dyn StreamReaderFactory>,
        services: Arc<ServiceRegistry>,
        backend: Option<Arc<dyn Coordinator>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let data_dir = config.node.data_dir.clone();

        let store = Arc::new(
            CheckpointStore::open(data_dir.join(CHECKPOINT_FILE))
                .await
                .context("opening checkpoint cache")?,
        );
        services
            .start_all()
            .await
            .context("starting downstream services")?;
        let initial_reader = factory.create().context("opening stream source")?;

        let provisional = NodeIdentity::load_or_create(
            &data_dir,
            config.node.name.as_deref(),
            &config.node.service_ip,
            0,
        )
        .context("loading node identity")?;

        let agent = AgentSync::new(
            provisional.node_id.clone(),
            config.transport.clone(),
            Arc::clone(&store),
            Arc::clone(&services),
            &shutdown,
        );
        let agent_server = agent
            .listen(&config.node.agent_listen)
            .await
            .with_context(|| format!("binding agent listener {}", config.node.agent_listen))?;
        let agent_addr = agent_server.local_addr()?;
        let identity = NodeIdentity {
            port: agent_addr.port(),
            ..provisional
        };
        agent_server.start(shutdown.clone());

        let pipeline = Arc::new(EventPipeline::new(
            Arc::clone(&store),
            Arc::clone(&services),
            agent.clone(),
        ));
        let controller = ReaderController::spawn(
            factory,
            Some(initial_reader),
            pipeline,
            &config.reader,
            &shutdown,
        );

        let membership = if config.cluster.enabled {
            let backend = match backend {
                Some(backend) => backend,
                None => build_coordinator(&config.cluster)
                    .context("creating coordination backend")?,
            };
            let observers: Vec<Arc<dyn LeadershipObserver>> =
                vec![controller.clone(), agent.clone()];
            let membership =
                Membership::new(config.cluster.clone(), identity.clone(), backend, observers);
            membership
                .start(&shutdown)
                .await
                .context("joining cluster")?;

            FailoverWatch::new(
                Arc::clone(&membership),
                config.cluster.watch_wait(),
                config.cluster.force_delete_attempts,
            )
            .start(shutdown.clone());
            agent.follow(
                Arc::clone(membership.directory()),
                config.node.follow_interval(),
            );
            Some(membership)
        } else {
            info!("Clustering disabled, {} leads permanently", identity);
            controller.on_leadership_change(true);
            agent.on_leadership_change(true);
            None
        };

        let control = config.control.clone();
        let node = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            identity,
            store,
            services,
            controller,
            agent,
            membership,
            agent_addr,
            control_addr: RwLock::new(None),
            shutdown,
        });

        if control.enabled {
            let handler: Arc<dyn ControlHandler> = node.clone();
            let server = control::bind(&control.listen, node.config().transport.clone(), handler)
                .await
                .with_context(|| format!("binding control listener {}", control.listen))?;
            *node.control_addr.write() = Some(server.local_addr()?);
            server.start(node.shutdown.clone());
        }

        info!("Relay node {} started", node.identity);
        Ok(node)
    }

    pub fn config(&self) -> Arc<RelayConfig> {
        Arc::clone(&self.config.read())
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn agent_addr(&self) -> SocketAddr {
        self.agent_addr
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        *self.control_addr.read()
    }

    pub fn membership(&self) -> Option<&Arc<Membership>> {
        self.membership.as_ref()
    }

    pub fn agent(&self) -> &Arc<AgentSync> {
        &self.agent
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn is_leader(&self) -> bool {
        match &self.membership {
            Some(membership) => membership.is_leader(),
            None => true,
        }
    }

    pub fn reader_status(&self) -> ReaderStatus {
        self.controller.status()
    }

    /// Resolves once shutdown has been requested
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Stop the reader, leave the cluster and release local resources
    pub async fn shutdown(&self) {
        info!("Relay node {} shutting down", self.identity);
        self.controller.shutdown().await;
        if let Some(membership) = &self.membership {
            membership.leave().await;
        }
        self.shutdown.cancel();
        self.services.close_all().await;
        if let Err(e) = self.store.close().await {
            warn!("Closing checkpoint cache failed: {}", e);
        }
    }

    async fn members(&self) -> anyhow::Result<Vec<ClusterMember>> {
        match &self.membership {
            Some(membership) => Ok(membership.list_members().await?),
            None => Ok(vec![ClusterMember {
                service_id: self.identity.node_id.clone(),
                hostname: self.identity.hostname.clone(),
                service_ip: self.identity.service_ip.clone(),
                port: self.identity.port,
                is_leader: true,
                status: MemberStatus::Online,
                session_id: self.identity.node_id.clone(),
            }]),
        }
    }
}

#[async_trait]
impl ControlHandler for RelayNode {
    async fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn reload(&self, target: &str) -> Result<(), String> {
        let reloaded = self.config().reload().map_err(|e| format!("{:#}", e))?;
        *self.config.write() = Arc::new(reloaded);
        self.services
            .reload(target)
            .await
            .map(|count| info!("Reloaded {} downstream services", count))
            .map_err(|e| e.to_string())
    }

    async fn show_members(&self) -> String {
        match self.members().await {
            Ok(members) => render_members(&self.identity, &members),
            Err(e) => format!("members unavailable: {:#}\r\n", e),
        }
    }
}
