use std::io::{Cursor, Read, Write};

use serde::{Deserialize, Serialize};

use crate::fsm::ClusterState;

use super::membership::Membership;
use super::types::{LogIndex, RaftSnapshotMeta, TypeConfig};

/// Full state-machine image superseding the log up to `meta.last_log_id`.
///
/// The same JSON document is written to `snapshot.json` and handed out by
/// [`ConsensusNode::snapshot`](super::ConsensusNode::snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: RaftSnapshotMeta,
    pub state: ClusterState,
}

impl Snapshot {
    pub fn last_index(&self) -> Option<LogIndex> {
        self.meta.last_log_id.map(|id| id.index)
    }

    /// Membership in effect at the snapshot point.
    pub fn membership(&self) -> Membership {
        Membership::from_stored(&self.meta.last_membership)
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), serde_json::Error> {
        serde_json::to_writer(writer, self)
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    /// Raft-side form: the state travels as the snapshot body, `meta` alongside.
    pub(crate) fn to_raft(&self) -> Result<openraft::Snapshot<TypeConfig>, serde_json::Error> {
        Ok(openraft::Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(serde_json::to_vec(&self.state)?)),
        })
    }

    pub(crate) fn from_raft(meta: RaftSnapshotMeta, body: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            meta,
            state: serde_json::from_slice(body)?,
        })
    }
}
