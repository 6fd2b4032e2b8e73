//! Node metrics as the rest of the crate sees them.
//!
//! openraft publishes its own metrics on a watch channel; a forwarder task
//! translates them to [`RaftMetrics`] (node names instead of raft ids) and
//! keeps the leader lease: a leader that cannot confirm its leadership with a
//! quorum within one election timeout stops reporting itself as leader.

use std::time::Duration;

use openraft::{Raft, ServerState};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::NodeId;

use super::membership::Membership;
use super::types::{LogIndex, Member, RaftId, Term, TypeConfig};

type CoreMetrics = openraft::RaftMetrics<RaftId, Member>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Not yet part of a configuration, or a non-voting member.
    Learner,
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl From<ServerState> for Role {
    fn from(state: ServerState) -> Self {
        match state {
            ServerState::Learner => Role::Learner,
            ServerState::Follower => Role::Follower,
            ServerState::Candidate => Role::Candidate,
            ServerState::Leader => Role::Leader,
            ServerState::Shutdown => Role::Shutdown,
        }
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftMetrics {
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    /// `None` while no leader is known, and on a leader whose lease lapsed.
    pub leader: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub last_log_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub snapshot_index: Option<LogIndex>,
    pub membership: Membership,
    /// Whether a leader heard from a quorum within the last election timeout.
    /// Always `true` on other roles.
    pub has_quorum: bool,
}

impl RaftMetrics {
    pub(crate) fn from_core(node_id: NodeId, core: &CoreMetrics, has_quorum: bool) -> Self {
        let role = Role::from(core.state);
        let has_quorum = role != Role::Leader || has_quorum;
        let leader = core
            .current_leader
            .filter(|_| has_quorum)
            .and_then(|id| core.membership_config.membership().get_node(&id));
        Self {
            node_id,
            role,
            current_term: core.current_term,
            leader: leader.map(|m| m.name.clone()),
            leader_addr: leader.map(|m| m.addr.clone()),
            last_log_index: core.last_log_index,
            last_applied: core.last_applied.map(|id| id.index),
            snapshot_index: core.snapshot.map(|id| id.index),
            membership: Membership::from_stored(&core.membership_config),
            has_quorum,
        }
    }

    /// Leader that still holds its lease.
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader && self.has_quorum
    }
}

/// Runs until the raft core stops; the last value published carries
/// [`Role::Shutdown`].
pub(crate) async fn forward_metrics(
    raft: Raft<TypeConfig>,
    node_id: NodeId,
    lease: Duration,
    tx: watch::Sender<RaftMetrics>,
) {
    let mut core = raft.metrics();
    let mut lease_check = tokio::time::interval(lease);
    lease_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut has_quorum = true;

    loop {
        tokio::select! {
            changed = core.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = core.borrow_and_update().clone();
                let previous = tx.borrow().clone();
                // a new term or role starts with a fresh lease
                if previous.current_term != snapshot.current_term
                    || previous.role != Role::from(snapshot.state)
                {
                    has_quorum = true;
                }
                publish(&tx, RaftMetrics::from_core(node_id.clone(), &snapshot, has_quorum));
            }
            _ = lease_check.tick() => {
                if core.borrow().state != ServerState::Leader {
                    continue;
                }
                let confirmed = matches!(
                    tokio::time::timeout(lease, raft.get_read_log_id()).await,
                    Ok(Ok(_))
                );
                if confirmed != has_quorum {
                    if confirmed {
                        info!(node_id = %node_id, "leader lease regained");
                    } else {
                        warn!(node_id = %node_id, "leader lost contact with quorum; no longer serving writes");
                    }
                    has_quorum = confirmed;
                }
                let snapshot = core.borrow().clone();
                publish(&tx, RaftMetrics::from_core(node_id.clone(), &snapshot, has_quorum));
            }
        }
    }

    tx.send_modify(|metrics| {
        metrics.role = Role::Shutdown;
        metrics.leader = None;
        metrics.leader_addr = None;
    });
    debug!(node_id = %node_id, "metrics forwarder stopped");
}

fn publish(tx: &watch::Sender<RaftMetrics>, metrics: RaftMetrics) {
    tx.send_if_modified(|current| {
        if *current == metrics {
            return false;
        }
        *current = metrics;
        true
    });
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use openraft::{CommittedLeaderId, LogId, StoredMembership, Vote};

    use super::*;
    use crate::consensus::raft_id;

    fn core_metrics(state: ServerState) -> CoreMetrics {
        let me = NodeId::new("n1");
        let id = raft_id(&me);
        let nodes: BTreeMap<RaftId, Member> = [(id, Member::new(me, "mem://n1"))].into();
        let voters: BTreeSet<RaftId> = [id].into();
        let mut metrics = CoreMetrics::new_initial(id);
        metrics.state = state;
        metrics.current_term = 4;
        metrics.vote = Vote::new_committed(4, id);
        metrics.current_leader = Some(id);
        metrics.last_log_index = Some(9);
        metrics.last_applied = Some(LogId::new(CommittedLeaderId::new(4, id), 9));
        metrics.membership_config = Arc::new(StoredMembership::new(
            None,
            openraft::Membership::new(vec![voters], nodes),
        ));
        metrics
    }

    #[test]
    fn leader_is_resolved_to_its_name_and_address() {
        let metrics = RaftMetrics::from_core(NodeId::new("n1"), &core_metrics(ServerState::Leader), true);

        assert!(metrics.is_leader());
        assert_eq!(metrics.leader, Some(NodeId::new("n1")));
        assert_eq!(metrics.leader_addr.as_deref(), Some("mem://n1"));
        assert_eq!(metrics.last_applied, Some(9));
        assert_eq!(metrics.snapshot_index, None);
        assert!(metrics.membership.is_voter(&NodeId::new("n1")));
    }

    #[test]
    fn lapsed_lease_hides_leadership() {
        let metrics = RaftMetrics::from_core(NodeId::new("n1"), &core_metrics(ServerState::Leader), false);

        assert_eq!(metrics.role, Role::Leader);
        assert!(!metrics.is_leader());
        assert_eq!(metrics.leader, None);
    }

    #[test]
    fn followers_always_report_quorum() {
        let metrics = RaftMetrics::from_core(NodeId::new("n1"), &core_metrics(ServerState::Follower), false);

        assert!(metrics.has_quorum);
        assert!(!metrics.is_leader());
        assert_eq!(metrics.leader, Some(NodeId::new("n1")));
    }
}
