use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::domain::NodeId;

use super::{Discovery, DiscoveryError, NodeAddress, normalize};

/// Fixed peer list from configuration.
pub struct StaticDiscovery {
    tx: watch::Sender<Vec<NodeAddress>>,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<NodeAddress>) -> Self {
        let (tx, _) = watch::channel(normalize(nodes));
        Self { tx }
    }

    /// Parse `id=host:port` entries, as written in `CONCORD_PEERS`.
    pub fn parse(list: &str) -> Result<Self, DiscoveryError> {
        let nodes = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('=') {
                Some((id, addr)) if !id.trim().is_empty() && !addr.trim().is_empty() => {
                    Ok(NodeAddress::new(id.trim(), addr.trim()))
                }
                _ => Err(DiscoveryError::InvalidAddress(entry.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(nodes))
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<NodeAddress>, DiscoveryError> {
        Ok(self.tx.borrow().clone())
    }

    async fn watch(&self) -> Result<watch::Receiver<Vec<NodeAddress>>, DiscoveryError> {
        Ok(self.tx.subscribe())
    }

    async fn register(&self, _node: NodeAddress) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported("static"))
    }

    async fn deregister(&self, _id: &NodeId) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported("static"))
    }
}

/// Polls a DNS name. Each resolved socket address is one member whose id is
/// the address itself.
pub struct DnsDiscovery {
    name: String,
    port: u16,
    poll_interval: Duration,
}

impl DnsDiscovery {
    pub fn new(name: impl Into<String>, port: u16, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            port,
            poll_interval,
        }
    }

    async fn resolve(name: &str, port: u16) -> Result<Vec<NodeAddress>, DiscoveryError> {
        let addrs = tokio::net::lookup_host((name, port))
            .await
            .map_err(|source| DiscoveryError::Resolve {
                name: name.to_string(),
                source,
            })?;
        Ok(normalize(
            addrs
                .map(|addr| NodeAddress::new(addr.to_string(), addr.to_string()))
                .collect(),
        ))
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn discover(&self) -> Result<Vec<NodeAddress>, DiscoveryError> {
        Self::resolve(&self.name, self.port).await
    }

    /// Spawns a poller that lives until every receiver is dropped.
    async fn watch(&self) -> Result<watch::Receiver<Vec<NodeAddress>>, DiscoveryError> {
        let initial = self.discover().await?;
        let (tx, rx) = watch::channel(initial);
        let name = self.name.clone();
        let port = self.port;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => match Self::resolve(&name, port).await {
                        Ok(nodes) => {
                            tx.send_if_modified(|current| {
                                if *current == nodes {
                                    false
                                } else {
                                    debug!(%name, members = nodes.len(), "dns membership changed");
                                    *current = nodes;
                                    true
                                }
                            });
                        }
                        // keep the last good list
                        Err(err) => warn!(error = %err, "dns discovery poll failed"),
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn register(&self, _node: NodeAddress) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported("dns"))
    }

    async fn deregister(&self, _id: &NodeId) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::Unsupported("dns"))
    }
}

/// In-process registry; clones share the same member table.
#[derive(Clone)]
pub struct RegistryDiscovery {
    members: Arc<Mutex<BTreeMap<NodeId, String>>>,
    tx: Arc<watch::Sender<Vec<NodeAddress>>>,
}

impl Default for RegistryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryDiscovery {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            members: Arc::new(Mutex::new(BTreeMap::new())),
            tx: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<NodeId, String>> {
        self.members.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, members: &BTreeMap<NodeId, String>) {
        let nodes: Vec<NodeAddress> = members
            .iter()
            .map(|(id, addr)| NodeAddress::new(id.clone(), addr.clone()))
            .collect();
        self.tx.send_if_modified(|current| {
            if *current == nodes {
                false
            } else {
                *current = nodes;
                true
            }
        });
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn discover(&self) -> Result<Vec<NodeAddress>, DiscoveryError> {
        Ok(self.tx.borrow().clone())
    }

    async fn watch(&self) -> Result<watch::Receiver<Vec<NodeAddress>>, DiscoveryError> {
        Ok(self.tx.subscribe())
    }

    async fn register(&self, node: NodeAddress) -> Result<(), DiscoveryError> {
        if node.addr.is_empty() {
            return Err(DiscoveryError::InvalidAddress(node.id.to_string()));
        }
        let mut members = self.lock();
        members.insert(node.id, node.addr);
        self.publish(&members);
        Ok(())
    }

    async fn deregister(&self, id: &NodeId) -> Result<(), DiscoveryError> {
        let mut members = self.lock();
        members.remove(id);
        self.publish(&members);
        Ok(())
    }
}
