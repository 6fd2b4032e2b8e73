//! Status - クラスタ全体の状態をまとめて返す

use serde::Serialize;

use crate::consensus::{ConsensusNode, RaftMetrics};
use crate::domain::QueueError;
use crate::queue::{DistributedTaskQueue, TaskCounts};
use crate::session::{SessionCoordinator, SessionSummary};

/// Point-in-time view of one node: raft role, sessions, durable task counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub raft: RaftMetrics,
    pub sessions: SessionSummary,
    pub tasks: TaskCounts,
    /// Locks held in the replicated state (not the durable lease table).
    pub replicated_locks: usize,
}

impl ClusterStatus {
    pub async fn collect(
        node: &ConsensusNode,
        sessions: &SessionCoordinator,
        queue: &DistributedTaskQueue,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            raft: node.metrics(),
            sessions: sessions.session_status(),
            tasks: queue.task_counts().await?,
            replicated_locks: node.fsm().locks().len(),
        })
    }
}
