use std::path::PathBuf;

use openraft::error::{ChangeMembershipError, ClientWriteError, Fatal, RaftError};
use thiserror::Error;
use tracing::warn;

use crate::domain::{ApplyError, NodeId};

use super::types::{LogIndex, Member, RaftId};

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// This node cannot accept writes; `leader` is a routing hint.
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("no quorum: entry was not committed in time")]
    NoQuorum,

    /// Committed, but the state machine refused the command.
    #[error("command rejected: {0}")]
    Rejected(#[from] ApplyError),

    #[error("a membership change is already in progress")]
    ConfigChangeInProgress,

    #[error("server {0} is not a cluster member")]
    UnknownServer(NodeId),

    #[error("snapshot at index {snapshot_index:?} is not newer than applied index {applied_index:?}")]
    StaleSnapshot {
        snapshot_index: Option<LogIndex>,
        applied_index: Option<LogIndex>,
    },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(#[source] serde_json::Error),

    #[error("no snapshot has been built yet")]
    NoSnapshot,

    /// Restoring under a running leader would fork it from its followers.
    #[error("restore is refused while this node is the leader")]
    RestoreOnLeader,

    #[error("invalid raft config: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid raft config: {0}")]
    RaftConfig(#[from] openraft::ConfigError),

    #[error("consensus node is shut down")]
    Shutdown,

    #[error("raft core failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<Fatal<RaftId>> for ConsensusError {
    fn from(err: Fatal<RaftId>) -> Self {
        match err {
            Fatal::Stopped => ConsensusError::Shutdown,
            other => {
                warn!(error = %other, "raft core stopped abnormally");
                ConsensusError::Fatal(other.to_string())
            }
        }
    }
}

impl From<RaftError<RaftId, ClientWriteError<RaftId, Member>>> for ConsensusError {
    fn from(err: RaftError<RaftId, ClientWriteError<RaftId, Member>>) -> Self {
        match err {
            RaftError::Fatal(fatal) => fatal.into(),
            RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
                ConsensusError::NotLeader {
                    leader: forward.leader_node.map(|member| member.name),
                }
            }
            RaftError::APIError(ClientWriteError::ChangeMembershipError(change)) => match change {
                ChangeMembershipError::InProgress(_) => ConsensusError::ConfigChangeInProgress,
                ChangeMembershipError::EmptyMembership(_) => {
                    ConsensusError::InvalidConfig("membership change would leave no voters")
                }
                ChangeMembershipError::LearnerNotFound(missing) => {
                    ConsensusError::UnknownServer(NodeId::new(missing.node_id.to_string()))
                }
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encode: {0}")]
    Encode(#[source] serde_json::Error),

    /// Fatal at startup: the node refuses to run on a state it cannot read.
    #[error("corrupt snapshot at {path}: {source}")]
    CorruptSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt raft log at {path}: {reason}")]
    CorruptLog { path: PathBuf, reason: String },

    #[error("corrupt hard state at {path}: {source}")]
    CorruptHardState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc timed out")]
    Timeout,

    #[error("rpc endpoint closed")]
    Closed,

    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// The peer answered, but its raft core reported an error.
    #[error("remote raft error: {0}")]
    Remote(String),
}
