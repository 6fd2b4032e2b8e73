//! ClusterNodeBuilder - 1 ノード分のワイヤリング
//!
//! consensus / ストア / キュー / セッション / discovery / バックグラウンドループを
//! まとめて組み立て、[`ClusterNode::shutdown`] 1 回で全部止めます。
//!
//! # Fail-fast 設計
//! - storage / transport が未設定なら `build()` が `BuildError::Missing`
//! - 0 の interval は `BuildError::Invalid`
//! - Raft 設定の検証エラーもここで返す

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{ConcordConfig, ConfigError, DiscoverySection};
use crate::consensus::{
    ConsensusError, ConsensusNode, FileStorage, Membership, NodeOptions, RaftConfig, RaftStorage,
    StorageError, TcpTransport, Transport, serve_tcp,
};
use crate::discovery::{
    ConsensusMembershipObserver, Discovery, DiscoveryManager, DnsDiscovery, StaticDiscovery,
};
use crate::domain::{NodeId, QueueError};
use crate::impls::{InMemoryLockStore, InMemoryTaskStore};
use crate::lock_manager::DistributedLockManager;
use crate::ports::{Clock, LockStore, SystemClock, TaskStore, UlidGenerator};
use crate::queue::{DistributedTaskQueue, QueueConfig};
use crate::session::{SessionConfig, SessionCoordinator};

use super::health_loop::HealthLoop;
use super::periodic::PeriodicTask;
use super::reaper_loop::ReaperLoop;
use super::status::ClusterStatus;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing {0}: set it on the builder before build()")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct ClusterNodeBuilder {
    id: NodeId,
    addr: String,
    raft: RaftConfig,
    queue: QueueConfig,
    session: SessionConfig,
    claim_sweep_interval: Duration,
    lock_cleanup_interval: Duration,
    storage: Option<Arc<dyn RaftStorage>>,
    transport: Option<Arc<dyn Transport>>,
    bootstrap: Option<Membership>,
    task_store: Option<Arc<dyn TaskStore>>,
    lock_store: Option<Arc<dyn LockStore>>,
    clock: Option<Arc<dyn Clock>>,
    discovery: Option<(Arc<dyn Discovery>, bool)>,
    background: bool,
}

impl ClusterNodeBuilder {
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            raft: RaftConfig::default(),
            queue: QueueConfig::default(),
            session: SessionConfig::default(),
            claim_sweep_interval: Duration::from_secs(30),
            lock_cleanup_interval: Duration::from_secs(60),
            storage: None,
            transport: None,
            bootstrap: None,
            task_store: None,
            lock_store: None,
            clock: None,
            discovery: None,
            background: true,
        }
    }

    /// File storage under `node.data_dir`, TCP transport and the configured
    /// discovery backend.
    ///
    /// Static peers (plus this node) become the bootstrap membership. DNS
    /// nodes start without one and wait for the leader to add them.
    pub fn from_config(config: &ConcordConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let id = NodeId::new(config.node.id.clone());
        let mut builder = Self::new(id.clone(), config.node.bind_addr.clone())
            .raft_config(config.raft_config())
            .queue_config(config.queue_config())
            .session_config(config.session_config())
            .sweep_intervals(config.claim_sweep_interval(), config.lock_cleanup_interval())
            .storage(Arc::new(FileStorage::open(&config.node.data_dir)?))
            .transport(Arc::new(TcpTransport::new()));

        match &config.discovery {
            DiscoverySection::Static { peers } => {
                let members = peers
                    .iter()
                    .map(|p| (p.id.clone(), p.addr.clone()))
                    .chain([(id, config.node.bind_addr.clone())]);
                builder = builder
                    .bootstrap(Membership::new(members))
                    .discovery(Arc::new(StaticDiscovery::new(peers.clone())), true);
            }
            DiscoverySection::Dns {
                name,
                port,
                poll_interval_ms,
            } => {
                let dns = DnsDiscovery::new(name.clone(), *port, Duration::from_millis(*poll_interval_ms));
                builder = builder.discovery(Arc::new(dns), true);
            }
        }
        Ok(builder)
    }

    pub fn raft_config(mut self, config: RaftConfig) -> Self {
        self.raft = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    pub fn sweep_intervals(mut self, claims: Duration, locks: Duration) -> Self {
        self.claim_sweep_interval = claims;
        self.lock_cleanup_interval = locks;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn RaftStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn bootstrap(mut self, membership: Membership) -> Self {
        self.bootstrap = Some(membership);
        self
    }

    /// Defaults to [`InMemoryTaskStore`].
    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    /// Defaults to [`InMemoryLockStore`].
    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Follow `discovery` and turn joins into voters (or learners).
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>, as_voter: bool) -> Self {
        self.discovery = Some((discovery, as_voter));
        self
    }

    /// Do not start sweeps, health checks or discovery.
    pub fn without_background_tasks(mut self) -> Self {
        self.background = false;
        self
    }

    /// Start the node. Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<ClusterNode, BuildError> {
        let storage = self.storage.ok_or(BuildError::Missing("raft storage"))?;
        let transport = self.transport.ok_or(BuildError::Missing("transport"))?;
        let intervals = [
            ("claim sweep interval", self.claim_sweep_interval),
            ("lock cleanup interval", self.lock_cleanup_interval),
            ("health check interval", self.session.health_check_interval),
        ];
        for (field, interval) in intervals {
            if interval.is_zero() {
                return Err(BuildError::Invalid {
                    field,
                    reason: "must be > 0",
                });
            }
        }
        if self.queue.claim_batch_size == 0 {
            return Err(BuildError::Invalid {
                field: "claim batch size",
                reason: "must be > 0",
            });
        }

        let node = ConsensusNode::start(NodeOptions {
            id: self.id.clone(),
            addr: self.addr,
            config: self.raft,
            storage,
            transport,
            bootstrap: self.bootstrap,
        })
        .await?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let lock_store = self
            .lock_store
            .unwrap_or_else(|| Arc::new(InMemoryLockStore::new()));
        let task_store = self
            .task_store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let locks = DistributedLockManager::new(lock_store, Arc::clone(&clock));
        let queue = DistributedTaskQueue::new(
            task_store,
            locks,
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            Arc::clone(&clock),
            self.queue,
        )
        .with_consensus(node.clone());
        let sessions = SessionCoordinator::new(node.clone(), queue.clone(), clock, self.session);

        let discovery = self.discovery.map(|(backend, as_voter)| {
            let mut manager = DiscoveryManager::new(backend, self.id.clone());
            manager.add_observer(Arc::new(ConsensusMembershipObserver::new(node.clone(), as_voter)));
            Arc::new(manager)
        });

        let mut background = Vec::new();
        if self.background {
            background.extend(
                ReaperLoop::new(queue.clone(), node.clone())
                    .spawn(self.claim_sweep_interval, self.lock_cleanup_interval),
            );
            background.push(HealthLoop::spawn(
                sessions.clone(),
                sessions.config().health_check_interval,
            ));
            if let Some(manager) = &discovery {
                let manager = Arc::clone(manager);
                background.push(PeriodicTask::spawn("discovery", move |stop| async move {
                    if let Err(err) = manager.run(stop).await {
                        warn!(error = %err, "discovery stopped");
                    }
                }));
            }
        }
        info!(node_id = %self.id, background = background.len(), "cluster node built");

        Ok(ClusterNode {
            node,
            queue,
            sessions,
            discovery,
            background: Mutex::new(background),
        })
    }
}

/// A running node and everything wired around it.
pub struct ClusterNode {
    node: ConsensusNode,
    queue: DistributedTaskQueue,
    sessions: SessionCoordinator,
    discovery: Option<Arc<DiscoveryManager>>,
    background: Mutex<Vec<PeriodicTask>>,
}

impl ClusterNode {
    pub fn id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn consensus(&self) -> &ConsensusNode {
        &self.node
    }

    pub fn queue(&self) -> &DistributedTaskQueue {
        &self.queue
    }

    pub fn locks(&self) -> &DistributedLockManager {
        self.queue.locks()
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub fn discovery(&self) -> Option<&Arc<DiscoveryManager>> {
        self.discovery.as_ref()
    }

    pub async fn status(&self) -> Result<ClusterStatus, QueueError> {
        ClusterStatus::collect(&self.node, &self.sessions, &self.queue).await
    }

    /// Serve raft RPCs from `listener` until shutdown.
    pub fn serve_tcp(&self, listener: TcpListener) {
        let endpoint = self.node.endpoint();
        let task = PeriodicTask::spawn("raft-rpc", move |stop| serve_tcp(listener, endpoint, stop));
        self.tasks().push(task);
    }

    /// Stop background tasks, then the consensus node.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks());
        for task in tasks {
            task.stop().await;
        }
        self.node.shutdown().await;
        info!(node_id = %self.node.id(), "cluster node stopped");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<PeriodicTask>> {
        self.background.lock().unwrap_or_else(|p| p.into_inner())
    }
}
