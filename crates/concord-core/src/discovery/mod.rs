//! Node discovery - クラスタメンバーのアドレス解決
//!
//! # バックエンド
//! - **StaticDiscovery**: 設定ファイルの固定リスト（起動後は変わらない）
//! - **DnsDiscovery**: `lookup_host` を定期的にポーリング
//! - **RegistryDiscovery**: プロセス内の動的レジストリ（register / deregister）
//!
//! [`DiscoveryManager`] は連続するリストを **node id で** 比較し、
//! 参加・離脱を [`MembershipObserver`] に通知します。

mod backends;
mod manager;

pub use backends::{DnsDiscovery, RegistryDiscovery, StaticDiscovery};
pub use manager::{ConsensusMembershipObserver, DiscoveryManager, MembershipDiff, MembershipObserver};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub id: NodeId,
    pub addr: String,
}

impl NodeAddress {
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to resolve {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} discovery does not support dynamic registration")]
    Unsupported(&'static str),

    #[error("invalid node address: {0}")]
    InvalidAddress(String),
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current member list, sorted by id.
    async fn discover(&self) -> Result<Vec<NodeAddress>, DiscoveryError>;

    /// Member lists over time. The receiver only wakes when the list changes.
    async fn watch(&self) -> Result<watch::Receiver<Vec<NodeAddress>>, DiscoveryError>;

    async fn register(&self, node: NodeAddress) -> Result<(), DiscoveryError>;

    async fn deregister(&self, id: &NodeId) -> Result<(), DiscoveryError>;
}

/// Sort by id and keep the first address seen for each id.
pub(crate) fn normalize(mut nodes: Vec<NodeAddress>) -> Vec<NodeAddress> {
    nodes.sort();
    nodes.dedup_by(|a, b| a.id == b.id);
    nodes
}
