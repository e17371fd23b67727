//! Membership & Lock Service - leader election over a coordination backend
//!
//! - Session lease renewed every heartbeat, registry entry re-registered
//!   with a fresh heartbeat tag
//! - Lock acquisition polled every election interval (and on demand)
//! - Leadership bit published in the registry tags
//! - Safety check: reaps offline peers, clears a lock nobody visibly holds,
//!   clears the lock when more than one leader is tagged

use super::config::ClusterConfig;
use super::coordinator::Coordinator;
use super::directory::{MemberDirectory, member_from_entry};
use super::identity::NodeIdentity;
use super::types::{
    ClusterError, ClusterMember, ClusterResult, LeadershipObserver, MemberTags,
    ServiceRegistration, now_ms,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Membership {
    config: ClusterConfig,
    identity: NodeIdentity,
    backend: Arc<dyn Coordinator>,
    directory: Arc<MemberDirectory>,

    /// Coordination session bound to the lock
    session: RwLock<Option<String>>,

    /// None until the first election round completes
    leader: RwLock<Option<bool>>,

    registered: AtomicBool,
    observers: Vec<Arc<dyn LeadershipObserver>>,
    election_trigger: Notify,

    /// Stops the background loops; child of the start shutdown signal
    loops: RwLock<Option<CancellationToken>>,
}

impl Membership {
    pub fn new(
        config: ClusterConfig,
        identity: NodeIdentity,
        backend: Arc<dyn Coordinator>,
        observers: Vec<Arc<dyn LeadershipObserver>>,
    ) -> Arc<Self> {
        let directory = Arc::new(MemberDirectory::new(Arc::clone(&backend), &config));
        Arc::new(Self {
            config,
            identity,
            backend,
            directory,
            session: RwLock::new(None),
            leader: RwLock::new(None),
            registered: AtomicBool::new(false),
            observers,
            election_trigger: Notify::new(),
            loops: RwLock::new(None),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn directory(&self) -> &Arc<MemberDirectory> {
        &self.directory
    }

    pub fn lock_key(&self) -> &str {
        &self.config.lock_key
    }

    pub fn is_leader(&self) -> bool {
        self.leader.read().unwrap_or(false)
    }

    /// Leadership as last observed; `None` before the first election
    pub fn leadership(&self) -> Option<bool> {
        *self.leader.read()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    /// Start membership: session, stale lock cleanup, registration, loops
    ///
    /// Fails when the backend cannot create a session; callers treat that
    /// as fatal.
    pub async fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> ClusterResult<()> {
        self.ensure_session().await?;
        self.cleanup_stale_self_lock().await;
        self.register().await?;

        let loops = shutdown.child_token();
        *self.loops.write() = Some(loops.clone());

        info!(
            "Joined cluster {} as {} ({})",
            self.config.lock_key, self.identity, self.identity.node_id
        );

        tokio::spawn(Arc::clone(self).heartbeat_loop(loops.clone()));
        tokio::spawn(Arc::clone(self).election_loop(loops.clone()));
        tokio::spawn(Arc::clone(self).safety_loop(loops));
        Ok(())
    }

    /// Leave the cluster cleanly: free the lock if held, deregister, end the session
    pub async fn leave(&self) {
        if let Some(loops) = self.loops.write().take() {
            loops.cancel();
        }
        if self.is_leader() {
            let key = self.config.lock_key.clone();
            if let Err(e) = self.release_lock(&key).await {
                warn!("Release lock on leave failed: {}", e);
            }
            if let Err(e) = self.force_delete(&key).await {
                warn!("Delete lock on leave failed: {}", e);
            }
        }
        if let Err(e) = self.deregister().await {
            warn!("Deregister on leave failed: {}", e);
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            if let Err(e) = self.backend.destroy_session(&session).await {
                warn!("Destroy session on leave failed: {}", e);
            }
        }
        *self.leader.write() = Some(false);
        info!("Left cluster {}", self.config.lock_key);
    }

    /// Publish this node's registry entry with a fresh heartbeat
    pub async fn register(&self) -> ClusterResult<()> {
        let tags = MemberTags {
            is_leader: self.is_leader(),
            session_id: self.identity.node_id.clone(),
            heartbeat_ms: now_ms(),
            hostname: self.identity.hostname.clone(),
            lock_key: self.config.lock_key.clone(),
        };
        let registration = ServiceRegistration {
            id: self.identity.node_id.clone(),
            name: self.config.service_name.clone(),
            address: self.identity.service_ip.clone(),
            port: self.identity.port,
            tags: tags.to_tags(),
        };
        self.backend.register_service(&registration).await?;
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn deregister(&self) -> ClusterResult<()> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Err(ClusterError::NotRegistered);
        }
        self.backend
            .deregister_service(&self.identity.node_id)
            .await
    }

    /// Renew the session lease, recreating the session if it was lost
    pub async fn renew_lease(&self) -> ClusterResult<()> {
        let session = self.session_id().ok_or(ClusterError::SessionEmpty)?;
        match self.backend.renew_session(&session).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_error() => {
                warn!("Session {} lost ({}), creating a new one", session, e);
                self.recreate_session().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Try to take `key`; true when this node's session holds it
    pub async fn acquire_lock(&self, key: &str) -> ClusterResult<bool> {
        let session = self.ensure_session().await?;
        match self.backend.acquire(key, &session).await {
            Ok(acquired) => Ok(acquired),
            Err(e) if e.is_session_error() => {
                error!("Lock error: {}, creating a new session", e);
                self.recreate_session().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn release_lock(&self, key: &str) -> ClusterResult<bool> {
        let session = self.ensure_session().await?;
        match self.backend.release(key, &session).await {
            Ok(released) => Ok(released),
            Err(e) if e.is_session_error() => {
                error!("Unlock error: {}, creating a new session", e);
                self.recreate_session().await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete `key` regardless of holder
    pub async fn force_delete(&self, key: &str) -> ClusterResult<()> {
        self.backend.delete(key).await
    }

    pub async fn list_members(&self) -> ClusterResult<Vec<ClusterMember>> {
        self.directory.members().await
    }

    pub async fn leader(&self) -> ClusterResult<ClusterMember> {
        self.directory.leader().await
    }

    /// Run an election round as soon as possible
    pub fn trigger_election(&self) {
        self.election_trigger.notify_one();
    }

    /// One election round: try the lock, publish and notify on change
    pub async fn elect(&self) {
        let key = self.config.lock_key.clone();
        match self.acquire_lock(&key).await {
            Ok(acquired) => self.update_leadership(acquired).await,
            Err(e) => warn!("Election round failed: {}", e),
        }
    }

    /// One safety pass over the member list
    pub async fn check_alive(&self) -> ClusterResult<()> {
        let members = self.directory.members().await?;
        if members.is_empty() {
            return Ok(());
        }

        let key = self.config.lock_key.clone();
        let mut leader_count = 0;
        for member in &members {
            if member.is_leader && member.is_online() {
                leader_count += 1;
            }
            if member.session_id == self.identity.node_id {
                continue;
            }
            if !member.is_online() {
                warn!("Member {} timed out, deregistering", member.service_id);
                if let Err(e) = self.backend.deregister_service(&member.service_id).await {
                    warn!("Deregister {} failed: {}", member.service_id, e);
                }
                if member.is_leader {
                    self.force_delete(&key).await?;
                }
            }
        }

        if leader_count == 0 && !self.is_leader() {
            warn!("No live leader and this node is not leader, clearing lock");
            self.force_delete(&key).await?;
        }
        if leader_count > 1 {
            warn!("{} leaders are running, clearing lock", leader_count);
            self.force_delete(&key).await?;
        }
        Ok(())
    }

    async fn update_leadership(&self, acquired: bool) {
        let changed = {
            let mut leader = self.leader.write();
            if *leader == Some(acquired) {
                false
            } else {
                *leader = Some(acquired);
                true
            }
        };
        if !changed {
            return;
        }

        if acquired {
            info!("{} became leader of {}", self.identity, self.config.lock_key);
        } else {
            info!("{} is a follower of {}", self.identity, self.config.lock_key);
        }

        for observer in &self.observers {
            observer.on_leadership_change(acquired);
        }
        if let Err(e) = self.register().await {
            warn!("Publishing leadership failed: {}", e);
        }
    }

    /// A crashed leader restarting finds its old entry still tagged leader
    ///
    /// Only the heartbeat age is checked: this process has just started, so
    /// probing its own address says nothing about the previous run.
    async fn cleanup_stale_self_lock(&self) {
        let entries = match self.backend.services(&self.config.service_name).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Member list unavailable at start: {}", e);
                return;
            }
        };
        let now = now_ms();
        let stale_self_leader = entries.iter().any(|entry| {
            member_from_entry(
                entry,
                &self.config.lock_key,
                now,
                self.config.keepalive_timeout(),
            )
            .is_some_and(|(member, stale)| {
                member.session_id == self.identity.node_id && member.is_leader && stale
            })
        });
        if stale_self_leader {
            warn!("This node still holds the lock from a previous run, unlocking");
            let key = self.config.lock_key.clone();
            if let Err(e) = self.release_lock(&key).await {
                debug!("Release of stale lock failed: {}", e);
            }
            if let Err(e) = self.force_delete(&key).await {
                warn!("Delete of stale lock failed: {}", e);
            }
        }
    }

    async fn ensure_session(&self) -> ClusterResult<String> {
        if let Some(session) = self.session_id() {
            return Ok(session);
        }
        self.recreate_session().await
    }

    async fn recreate_session(&self) -> ClusterResult<String> {
        let session = self
            .backend
            .create_session(&self.identity.node_id, self.config.session_ttl())
            .await?;
        if session.is_empty() {
            return Err(ClusterError::SessionEmpty);
        }
        debug!("Using coordination session {}", session);
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_lease().await {
                        warn!("Lease renewal failed: {}", e);
                    }
                    if let Err(e) = self.register().await {
                        warn!("Heartbeat registration failed: {}", e);
                    } else if let Err(e) = self.backend.pass_check(&self.identity.node_id).await {
                        warn!("Health check update failed: {}", e);
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn election_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.election_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.election_trigger.notified() => {
                    debug!("Election triggered");
                }
            }
            self.elect().await;
        }
        debug!("Election loop stopped");
    }

    async fn safety_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_alive().await {
                        warn!("Cluster safety check failed: {}", e);
                    }
                }
            }
        }
        debug!("Safety loop stopped");
    }
}
