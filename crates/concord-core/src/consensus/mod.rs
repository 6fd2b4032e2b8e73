//! Consensus - openraft による replicated log
//!
//! クラスタ状態（sessions / task assignments / locks）を変更するコマンドは、
//! 全てここを通して過半数に複製されてから FSM に適用されます。
//!
//! # 構成
//! - **log_store / state_machine**: openraft のストレージ trait を `RaftStorage` port と FSM に接続
//! - **storage**: vote / log / snapshot の永続化（`FileStorage`, `MemStorage`）
//! - **network / transport**: ノード間 RPC（`InMemoryNetwork`, `TcpTransport`）
//! - **metrics**: openraft の metrics を名前ベースに変換し、leader lease を管理
//! - **ConsensusNode**: 外部から使うハンドル（clone 可能）

mod config;
mod error;
mod log_store;
mod membership;
mod message;
mod metrics;
mod network;
mod snapshot;
mod state_machine;
mod storage;
mod tcp;
mod transport;
mod types;


use std::collections::BTreeSet;
use std::future::Future;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openraft::error::{InitializeError, RaftError};
use openraft::{ChangeMembers, Raft, ServerState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use config::RaftConfig;
pub use error::{ConsensusError, StorageError, TransportError};
pub use membership::Membership;
pub use message::{RaftRequest, RaftResponse};
pub use metrics::{RaftMetrics, Role};
pub use snapshot::Snapshot;
pub use storage::{FileStorage, HardState, MemStorage, PersistedState, RaftStorage};
pub use tcp::{TcpTransport, serve_tcp};
pub use transport::{InMemoryNetwork, RpcEndpoint, Transport};
pub use types::{
    CommandResult, LogEntry, LogId, LogIndex, Member, RaftId, RaftSnapshotMeta, StoredMembership, Term,
    TypeConfig, Vote, raft_id,
};

use crate::domain::{Command, NodeId};
use crate::fsm::SharedFsm;

use log_store::LogStore;
use network::Network;
use state_machine::StateMachineStore;

/// Everything needed to start one consensus node.
pub struct NodeOptions {
    pub id: NodeId,
    /// Address peers use to reach this node.
    pub addr: String,
    pub config: RaftConfig,
    pub storage: Arc<dyn RaftStorage>,
    pub transport: Arc<dyn Transport>,
    /// Initial voters, committed as the first membership entry only when the
    /// node has never been initialized. Nodes joining an existing cluster
    /// pass `None` and wait to be added.
    pub bootstrap: Option<Membership>,
}

/// Handle to a running consensus node.
///
/// Clones share the same node. Readers use [`ConsensusNode::fsm`] and
/// [`ConsensusNode::metrics`]; writes go through [`ConsensusNode::apply`].
#[derive(Clone)]
pub struct ConsensusNode {
    id: NodeId,
    config: Arc<RaftConfig>,
    raft: Raft<TypeConfig>,
    machine: StateMachineStore,
    metrics: watch::Receiver<RaftMetrics>,
    fsm: SharedFsm,
    forwarder: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConsensusNode {
    /// Load state from storage and start the raft core. Must be called
    /// inside a tokio runtime.
    pub async fn start(options: NodeOptions) -> Result<Self, ConsensusError> {
        let raft_config = Arc::new(options.config.to_openraft()?);
        let config = Arc::new(options.config);
        let persisted = options.storage.load()?;
        let fsm = SharedFsm::new();

        let log_store = LogStore::new(Arc::clone(&options.storage), &persisted);
        let machine = StateMachineStore::new(fsm.clone(), Arc::clone(&options.storage), persisted.snapshot);
        let id = raft_id(&options.id);
        let network = Network::new(id, options.transport, config.rpc_timeout);
        let raft = Raft::new(id, raft_config, network, log_store, machine.clone()).await?;

        if let Some(membership) = options.bootstrap {
            match raft.initialize(membership.voter_nodes()).await {
                Ok(()) => info!(node_id = %options.id, voters = membership.voters.len(), "cluster initialized"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    debug!(node_id = %options.id, "already initialized; bootstrap membership ignored");
                }
                Err(RaftError::APIError(InitializeError::NotInMembers(_))) => {
                    raft.shutdown().await.ok();
                    return Err(ConsensusError::InvalidConfig(
                        "bootstrap membership must include this node as a voter",
                    ));
                }
                Err(RaftError::Fatal(fatal)) => return Err(fatal.into()),
            }
        }

        let initial = RaftMetrics::from_core(options.id.clone(), &raft.metrics().borrow(), true);
        let (tx, metrics) = watch::channel(initial);
        let forwarder = tokio::spawn(metrics::forward_metrics(
            raft.clone(),
            options.id.clone(),
            config.election_timeout,
            tx,
        ));

        Ok(Self {
            id: options.id,
            config,
            raft,
            machine,
            metrics,
            fsm,
            forwarder: Arc::new(Mutex::new(Some(forwarder))),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Read-only view of the replicated state machine on this node.
    pub fn fsm(&self) -> &SharedFsm {
        &self.fsm
    }

    /// Inbound side, for wiring into a server or an [`InMemoryNetwork`].
    pub fn endpoint(&self) -> RpcEndpoint {
        RpcEndpoint::new(self.raft.clone())
    }

    /// Replicate `command` and wait until it is applied on this node.
    ///
    /// # Errors
    /// - `NotLeader`: this node is not the leader (carries a hint)
    /// - `NoQuorum`: not committed within `apply_timeout`
    /// - `Rejected`: committed, but refused by the state machine
    pub async fn apply(&self, command: Command) -> Result<LogIndex, ConsensusError> {
        {
            let metrics = self.metrics.borrow();
            if metrics.role == Role::Leader && !metrics.has_quorum {
                return Err(ConsensusError::NotLeader { leader: None });
            }
        }
        let response = self
            .within(self.config.apply_timeout, self.raft.client_write(command))
            .await??;
        response.data.0?;
        Ok(response.log_id.index)
    }

    /// Leader that has heard from a quorum within the last election timeout.
    pub fn is_leader(&self) -> bool {
        self.metrics.borrow().is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.metrics.borrow().leader.clone()
    }

    pub fn leader_addr(&self) -> Option<String> {
        self.metrics.borrow().leader_addr.clone()
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.metrics.borrow().clone()
    }

    /// Subscribe to metric changes.
    pub fn watch_metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics.clone()
    }

    /// Wait until this node knows a leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, ConsensusError> {
        let mut rx = self.metrics.clone();
        let wait = async {
            loop {
                let leader = rx.borrow_and_update().leader.clone();
                if let Some(leader) = leader {
                    return Ok(leader);
                }
                if rx.changed().await.is_err() {
                    return Err(ConsensusError::Shutdown);
                }
            }
        };
        self.within(timeout, wait).await?
    }

    /// Add (or promote to) a voting member. Leader only.
    ///
    /// The node first joins as a learner and is promoted once it has caught up.
    pub async fn add_voter(&self, id: NodeId, addr: impl Into<String>) -> Result<LogIndex, ConsensusError> {
        let rid = raft_id(&id);
        let change = async {
            self.raft.add_learner(rid, Member::new(id.clone(), addr), true).await?;
            let response = self
                .raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([rid])), false)
                .await?;
            Ok::<_, ConsensusError>(response.log_id.index)
        };
        let index = self.within(self.config.membership_timeout, change).await??;
        info!(node_id = %id, index, "voter added");
        Ok(index)
    }

    /// Add a non-voting member that receives the log but never votes.
    pub async fn add_nonvoter(&self, id: NodeId, addr: impl Into<String>) -> Result<LogIndex, ConsensusError> {
        let change = self.raft.add_learner(raft_id(&id), Member::new(id.clone(), addr), false);
        let response = self.within(self.config.membership_timeout, change).await??;
        info!(node_id = %id, index = response.log_id.index, "non-voter added");
        Ok(response.log_id.index)
    }

    pub async fn remove_server(&self, id: NodeId) -> Result<LogIndex, ConsensusError> {
        let membership = self.metrics.borrow().membership.clone();
        let target = BTreeSet::from([raft_id(&id)]);
        let change = if membership.is_voter(&id) {
            ChangeMembers::RemoveVoters(target)
        } else if membership.contains(&id) {
            ChangeMembers::RemoveNodes(target)
        } else {
            return Err(ConsensusError::UnknownServer(id));
        };
        let response = self
            .within(self.config.membership_timeout, self.raft.change_membership(change, false))
            .await??;
        info!(node_id = %id, index = response.log_id.index, "server removed");
        Ok(response.log_id.index)
    }

    /// Capture the applied state (and compact the log behind it).
    pub async fn snapshot(&self) -> Result<Snapshot, ConsensusError> {
        let mut core = self.raft.metrics();
        let target = core.borrow().last_applied.map(|id| id.index);
        if target.is_none() {
            return Err(ConsensusError::NoSnapshot);
        }
        self.raft.trigger().snapshot().await?;
        let built = async {
            loop {
                if core.borrow_and_update().snapshot.map(|id| id.index) >= target {
                    return Ok(());
                }
                if core.changed().await.is_err() {
                    return Err(ConsensusError::Shutdown);
                }
            }
        };
        self.within(self.config.apply_timeout, built).await??;
        self.machine.current_snapshot().ok_or(ConsensusError::NoSnapshot)
    }

    /// Replace local state with a snapshot read from `reader`.
    ///
    /// Refused on the leader, and when the snapshot does not reach past what
    /// this node has already applied.
    pub async fn restore<R: Read>(&self, reader: R) -> Result<(), ConsensusError> {
        let snapshot = Snapshot::read_from(reader).map_err(ConsensusError::InvalidSnapshot)?;
        let (state, applied) = {
            let core = self.raft.metrics();
            let core = core.borrow();
            (core.state, core.last_applied)
        };
        if state == ServerState::Leader {
            return Err(ConsensusError::RestoreOnLeader);
        }
        if snapshot.meta.last_log_id <= applied {
            return Err(ConsensusError::StaleSnapshot {
                snapshot_index: snapshot.last_index(),
                applied_index: applied.map(|id| id.index),
            });
        }
        let vote = self.raft.with_raft_state(|state| *state.vote_ref()).await?;
        let raft_snapshot = snapshot.to_raft().map_err(ConsensusError::InvalidSnapshot)?;
        self.raft.install_full_snapshot(vote, raft_snapshot).await?;
        info!(node_id = %self.id, index = ?snapshot.last_index(), "snapshot restored");
        Ok(())
    }

    /// Stop the raft core; pending and later calls fail with `Shutdown`.
    pub async fn shutdown(&self) {
        if let Err(err) = self.raft.shutdown().await {
            warn!(node_id = %self.id, error = %err, "raft core ended abnormally");
        }
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(forwarder) = forwarder
            && let Err(err) = forwarder.await
        {
            warn!(node_id = %self.id, error = %err, "metrics forwarder ended abnormally");
        }
    }

    /// A deadline that passes without an answer means no quorum acted on it.
    async fn within<T>(&self, timeout: Duration, fut: impl Future<Output = T>) -> Result<T, ConsensusError> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ConsensusError::NoQuorum)
    }
}
