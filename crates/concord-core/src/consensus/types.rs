use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::domain::{ApplyError, Command, NodeId};

pub type LogIndex = u64;
pub type Term = u64;

/// Numeric id openraft uses for a [`NodeId`]; see [`raft_id`].
pub type RaftId = u64;

openraft::declare_raft_types!(
    /// Type parameters of the cluster's openraft instance.
    pub TypeConfig:
        D = Command,
        R = CommandResult,
        NodeId = RaftId,
        Node = Member,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

pub type LogEntry = openraft::Entry<TypeConfig>;
pub type LogId = openraft::LogId<RaftId>;
pub type Vote = openraft::Vote<RaftId>;
pub type RaftSnapshotMeta = openraft::SnapshotMeta<RaftId, Member>;
pub type StoredMembership = openraft::StoredMembership<RaftId, Member>;

/// A cluster member as openraft sees it: the stable name plus the address
/// peers dial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: NodeId,
    pub addr: String,
}

impl Member {
    pub fn new(name: NodeId, addr: impl Into<String>) -> Self {
        Self {
            name,
            addr: addr.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// Outcome of applying one log entry. Membership and blank entries always
/// succeed; commands may be refused by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult(pub Result<(), ApplyError>);

impl CommandResult {
    pub fn ok() -> Self {
        Self(Ok(()))
    }
}

/// FNV-1a of the node name. Every node derives the same id for a name, so
/// no id allocation has to be agreed on before the cluster exists.
pub fn raft_id(name: &NodeId) -> RaftId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    name.as_str()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_id_is_stable_and_distinguishes_names() {
        let a = raft_id(&NodeId::new("node-1"));
        assert_eq!(a, raft_id(&NodeId::new("node-1")));
        assert_ne!(a, raft_id(&NodeId::new("node-2")));
        // FNV-1a of the empty input is the offset basis
        assert_eq!(raft_id(&NodeId::new("")), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn command_result_round_trips_rejections() {
        let rejected = CommandResult(Err(ApplyError::UnknownSession("ghost".into())));
        let json = serde_json::to_string(&rejected).unwrap();
        assert_eq!(serde_json::from_str::<CommandResult>(&json).unwrap(), rejected);
    }
}
