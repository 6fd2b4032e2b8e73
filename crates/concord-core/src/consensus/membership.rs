use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::NodeId;

use super::types::{Member, RaftId, StoredMembership, raft_id};

/// Cluster configuration by node name: voting members and non-voting
/// learners, each with the address peers use to reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub learners: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn new<I, A>(voters: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, A)>,
        A: Into<String>,
    {
        Self {
            voters: voters.into_iter().map(|(id, a)| (id, a.into())).collect(),
            learners: BTreeMap::new(),
        }
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.voters.contains_key(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.voters.contains_key(id) || self.learners.contains_key(id)
    }

    pub fn address(&self, id: &NodeId) -> Option<&str> {
        self.voters
            .get(id)
            .or_else(|| self.learners.get(id))
            .map(String::as_str)
    }

    /// Votes needed for a majority of voters.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, &String)> {
        self.voters.iter().chain(self.learners.iter())
    }

    /// Voters keyed by raft id, the shape `Raft::initialize` takes.
    pub(crate) fn voter_nodes(&self) -> BTreeMap<RaftId, Member> {
        self.voters
            .iter()
            .map(|(id, addr)| (raft_id(id), Member::new(id.clone(), addr.clone())))
            .collect()
    }

    /// Name-keyed view of openraft's membership. During a joint change the
    /// union of both configurations counts as voters.
    pub(crate) fn from_stored(stored: &StoredMembership) -> Self {
        let config = stored.membership();
        let voter_ids: BTreeSet<RaftId> = config.voter_ids().collect();
        let mut membership = Self::default();
        for (id, member) in config.nodes() {
            let side = if voter_ids.contains(id) {
                &mut membership.voters
            } else {
                &mut membership.learners
            };
            side.insert(member.name.clone(), member.addr.clone());
        }
        membership
    }
}
