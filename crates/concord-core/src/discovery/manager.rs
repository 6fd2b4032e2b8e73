use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::consensus::ConsensusNode;
use crate::domain::NodeId;

use super::{Discovery, DiscoveryError, NodeAddress};

/// Receives membership changes detected by a [`DiscoveryManager`].
#[async_trait]
pub trait MembershipObserver: Send + Sync {
    async fn on_node_joined(&self, node: &NodeAddress);

    async fn on_node_left(&self, node: &NodeAddress);

    /// Same id, new address.
    async fn on_node_readdressed(&self, _node: &NodeAddress) {}
}

/// Difference between two member lists, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub joined: Vec<NodeAddress>,
    pub left: Vec<NodeAddress>,
    pub readdressed: Vec<NodeAddress>,
}

impl MembershipDiff {
    pub fn between(previous: &BTreeMap<NodeId, String>, current: &BTreeMap<NodeId, String>) -> Self {
        let mut diff = Self::default();
        for (id, addr) in current {
            match previous.get(id) {
                None => diff.joined.push(NodeAddress::new(id.clone(), addr.clone())),
                Some(old) if old != addr => {
                    diff.readdressed.push(NodeAddress::new(id.clone(), addr.clone()))
                }
                Some(_) => {}
            }
        }
        diff.left = previous
            .iter()
            .filter(|(id, _)| !current.contains_key(*id))
            .map(|(id, addr)| NodeAddress::new(id.clone(), addr.clone()))
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.readdressed.is_empty()
    }
}

/// Tracks the member list of one [`Discovery`] backend and notifies observers.
///
/// The local node is never reported.
pub struct DiscoveryManager {
    discovery: Arc<dyn Discovery>,
    local: NodeId,
    observers: Vec<Arc<dyn MembershipObserver>>,
    known: Mutex<BTreeMap<NodeId, String>>,
}

impl DiscoveryManager {
    pub fn new(discovery: Arc<dyn Discovery>, local: NodeId) -> Self {
        Self {
            discovery,
            local,
            observers: Vec::new(),
            known: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn MembershipObserver>) {
        self.observers.push(observer);
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Members seen by the last sync, excluding the local node.
    pub async fn known(&self) -> Vec<NodeAddress> {
        self.known
            .lock()
            .await
            .iter()
            .map(|(id, addr)| NodeAddress::new(id.clone(), addr.clone()))
            .collect()
    }

    /// Read the backend once and apply the result.
    pub async fn sync_once(&self) -> Result<MembershipDiff, DiscoveryError> {
        let nodes = self.discovery.discover().await?;
        Ok(self.apply(nodes).await)
    }

    /// Diff `nodes` against the known list, then notify observers.
    pub async fn apply(&self, nodes: Vec<NodeAddress>) -> MembershipDiff {
        let current: BTreeMap<NodeId, String> = nodes
            .into_iter()
            .filter(|node| node.id != self.local)
            .map(|node| (node.id, node.addr))
            .collect();

        let diff = {
            let mut known = self.known.lock().await;
            let diff = MembershipDiff::between(&known, &current);
            *known = current;
            diff
        };
        if diff.is_empty() {
            return diff;
        }
        info!(
            joined = diff.joined.len(),
            left = diff.left.len(),
            readdressed = diff.readdressed.len(),
            "cluster membership changed"
        );

        for observer in &self.observers {
            for node in &diff.joined {
                observer.on_node_joined(node).await;
            }
            for node in &diff.readdressed {
                observer.on_node_readdressed(node).await;
            }
            for node in &diff.left {
                observer.on_node_left(node).await;
            }
        }
        diff
    }

    /// Follow the backend's watch channel until `stop` flips to `true`.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), DiscoveryError> {
        let mut updates = self.discovery.watch().await?;
        let initial = updates.borrow_and_update().clone();
        self.apply(initial).await;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        debug!("discovery watch closed");
                        break;
                    }
                    let nodes = updates.borrow_and_update().clone();
                    self.apply(nodes).await;
                }
            }
        }
        Ok(())
    }
}

/// Feeds discovery events into Raft membership. Only acts while the local
/// node is leader; followers ignore events.
pub struct ConsensusMembershipObserver {
    node: ConsensusNode,
    as_voter: bool,
}

impl ConsensusMembershipObserver {
    pub fn new(node: ConsensusNode, as_voter: bool) -> Self {
        Self { node, as_voter }
    }

    async fn add(&self, node: &NodeAddress) {
        if &node.id == self.node.id() || !self.node.is_leader() {
            return;
        }
        let result = if self.as_voter {
            self.node.add_voter(node.id.clone(), node.addr.clone()).await
        } else {
            self.node.add_nonvoter(node.id.clone(), node.addr.clone()).await
        };
        match result {
            Ok(index) => info!(node_id = %node.id, addr = %node.addr, index, "added cluster member"),
            Err(err) => warn!(node_id = %node.id, error = %err, "failed to add cluster member"),
        }
    }
}

#[async_trait]
impl MembershipObserver for ConsensusMembershipObserver {
    async fn on_node_joined(&self, node: &NodeAddress) {
        self.add(node).await;
    }

    async fn on_node_left(&self, node: &NodeAddress) {
        if &node.id == self.node.id() || !self.node.is_leader() {
            return;
        }
        match self.node.remove_server(node.id.clone()).await {
            Ok(index) => info!(node_id = %node.id, index, "removed cluster member"),
            Err(err) => warn!(node_id = %node.id, error = %err, "failed to remove cluster member"),
        }
    }

    async fn on_node_readdressed(&self, node: &NodeAddress) {
        self.add(node).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::consensus::{InMemoryNetwork, MemStorage, Membership, NodeOptions, RaftConfig};
    use crate::discovery::{RegistryDiscovery, StaticDiscovery};

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MembershipObserver for Recorder {
        async fn on_node_joined(&self, node: &NodeAddress) {
            self.events.lock().unwrap().push(format!("join {}", node.id));
        }

        async fn on_node_left(&self, node: &NodeAddress) {
            self.events.lock().unwrap().push(format!("leave {}", node.id));
        }

        async fn on_node_readdressed(&self, node: &NodeAddress) {
            self.events.lock().unwrap().push(format!("move {} {}", node.id, node.addr));
        }
    }

    fn map(entries: &[(&str, &str)]) -> BTreeMap<NodeId, String> {
        entries
            .iter()
            .map(|(id, addr)| (NodeId::new(*id), addr.to_string()))
            .collect()
    }

    #[test]
    fn diff_is_keyed_by_id() {
        let previous = map(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let current = map(&[("a", "1"), ("b", "9"), ("d", "4")]);
        let diff = MembershipDiff::between(&previous, &current);
        assert_eq!(diff.joined, vec![NodeAddress::new("d", "4")]);
        assert_eq!(diff.left, vec![NodeAddress::new("c", "3")]);
        assert_eq!(diff.readdressed, vec![NodeAddress::new("b", "9")]);
        assert!(MembershipDiff::between(&current, &current).is_empty());
    }

    #[tokio::test]
    async fn local_node_is_never_reported() {
        let discovery = StaticDiscovery::new(vec![
            NodeAddress::new("self", "a:1"),
            NodeAddress::new("peer", "b:1"),
        ]);
        let recorder = Arc::new(Recorder::default());
        let mut manager = DiscoveryManager::new(Arc::new(discovery), NodeId::new("self"));
        manager.add_observer(recorder.clone());

        let diff = manager.sync_once().await.unwrap();
        assert_eq!(diff.joined, vec![NodeAddress::new("peer", "b:1")]);
        assert!(manager.sync_once().await.unwrap().is_empty());
        assert_eq!(recorder.events(), vec!["join peer"]);
    }

    #[tokio::test]
    async fn run_follows_registry_until_stopped() {
        let registry = RegistryDiscovery::new();
        let recorder = Arc::new(Recorder::default());
        let mut manager = DiscoveryManager::new(Arc::new(registry.clone()), NodeId::new("self"));
        manager.add_observer(recorder.clone());
        let manager = Arc::new(manager);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&manager).run(stop_rx));

        registry.register(NodeAddress::new("n1", "a:1")).await.unwrap();
        wait_for(|| recorder.events().len() == 1).await;
        registry.register(NodeAddress::new("n1", "a:2")).await.unwrap();
        wait_for(|| recorder.events().len() == 2).await;
        registry.deregister(&NodeId::new("n1")).await.unwrap();
        wait_for(|| recorder.events().len() == 3).await;

        assert_eq!(recorder.events(), vec!["join n1", "move n1 a:2", "leave n1"]);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn consensus_observer_tracks_learners_on_the_leader() {
        let network = InMemoryNetwork::new();
        let id = NodeId::new("n0");
        let node = ConsensusNode::start(NodeOptions {
            id: id.clone(),
            addr: "mem://n0".into(),
            config: RaftConfig {
                heartbeat_interval: Duration::from_millis(20),
                election_timeout: Duration::from_millis(100),
                rpc_timeout: Duration::from_millis(50),
                ..RaftConfig::default()
            },
            storage: Arc::new(MemStorage::new()),
            transport: network.transport(id.clone()),
            bootstrap: Some(Membership::new([(id.clone(), "mem://n0".to_string())])),
        })
        .await
        .unwrap();
        network.register(id.clone(), node.endpoint());
        node.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        wait_for(|| node.is_leader()).await;

        let mut manager = DiscoveryManager::new(Arc::new(StaticDiscovery::new(vec![])), id.clone());
        manager.add_observer(Arc::new(ConsensusMembershipObserver::new(node.clone(), false)));

        manager
            .apply(vec![
                NodeAddress::new("n0", "mem://n0"),
                NodeAddress::new("n9", "mem://n9"),
            ])
            .await;
        wait_for(|| node.metrics().membership.contains(&NodeId::new("n9"))).await;
        assert!(!node.metrics().membership.is_voter(&NodeId::new("n9")));

        manager.apply(vec![NodeAddress::new("n0", "mem://n0")]).await;
        wait_for(|| !node.metrics().membership.contains(&NodeId::new("n9"))).await;

        node.shutdown().await;
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }
}
