//! Transport port - ノード間 RPC の抽象化
//!
//! # 実装
//! - **InMemoryNetwork**: 同一プロセス内のクラスタ（テスト・デモ用、パーティション再現可能）
//! - **TcpTransport**: 長さプレフィックス付き JSON フレーム（`tcp` モジュール）
//!
//! openraft 側からは [`Network`](super::network::Network) がこの trait を呼び出します。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use openraft::Raft;

use crate::domain::NodeId;

use super::{RaftRequest, RaftResponse, TransportError, TypeConfig};

/// Outbound RPC to a peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: &NodeId,
        addr: &str,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError>;
}

/// Inbound side of a node: hands a request to its raft core and waits for
/// the answer. Servers (TCP, in-memory) deliver requests through this.
#[derive(Clone)]
pub struct RpcEndpoint {
    raft: Raft<TypeConfig>,
}

impl RpcEndpoint {
    pub(crate) fn new(raft: Raft<TypeConfig>) -> Self {
        Self { raft }
    }

    /// Errors raised by the raft core travel back inside the response; the
    /// call itself only fails when nothing can answer.
    pub async fn handle(&self, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let response = match request {
            RaftRequest::Vote(req) => RaftResponse::Vote(self.raft.vote(req).await),
            RaftRequest::Append(req) => RaftResponse::Append(self.raft.append_entries(req).await),
            RaftRequest::InstallSnapshot(req) => {
                RaftResponse::InstallSnapshot(self.raft.install_snapshot(req).await)
            }
        };
        Ok(response)
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<NodeId, RpcEndpoint>,
    isolated: HashSet<NodeId>,
}

/// In-process network connecting registered endpoints.
///
/// An isolated node can neither send nor receive, which is enough to model
/// crashes and minority partitions.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, endpoint: RpcEndpoint) {
        self.lock().endpoints.insert(id, endpoint);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.lock().endpoints.remove(id);
    }

    pub fn isolate(&self, id: &NodeId) {
        self.lock().isolated.insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.lock().isolated.remove(id);
    }

    pub fn heal_all(&self) {
        self.lock().isolated.clear();
    }

    /// Transport used by node `from`.
    pub fn transport(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(InMemoryTransport {
            from,
            network: self.clone(),
        })
    }

    fn route(&self, from: &NodeId, target: &NodeId) -> Result<RpcEndpoint, TransportError> {
        let state = self.lock();
        if state.isolated.contains(from) || state.isolated.contains(target) {
            return Err(TransportError::Unreachable(target.clone()));
        }
        state
            .endpoints
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(target.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        target: &NodeId,
        _addr: &str,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        let endpoint = self.network.route(&self.from, target)?;
        let response = endpoint.handle(request).await?;
        // a partition that appeared mid-flight drops the reply too
        self.network.route(&self.from, target)?;
        Ok(response)
    }
}
