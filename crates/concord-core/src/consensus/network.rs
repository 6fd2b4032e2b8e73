//! openraft の `RaftNetworkFactory` / `RaftNetwork` を [`Transport`] port に接続する
//!
//! 送信先ごとに [`PeerClient`] を作り、リクエストを [`RaftRequest`] に包んで
//! transport に渡します。transport 側のエラーは openraft の `RPCError` に変換し、
//! 相手の raft core が返したエラーは `RemoteError` として返します。

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Timeout, Unreachable,
};
use openraft::network::{RPCOption, RPCTypes, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tracing::trace;

use super::{Member, RaftId, RaftRequest, RaftResponse, Transport, TransportError, TypeConfig};

type RpcResult<T, E = openraft::error::Infallible> = Result<T, RPCError<RaftId, Member, RaftError<RaftId, E>>>;

/// Builds one [`PeerClient`] per replication target.
pub(crate) struct Network {
    source: RaftId,
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl Network {
    pub(crate) fn new(source: RaftId, transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            source,
            transport,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = PeerClient;

    async fn new_client(&mut self, target: RaftId, node: &Member) -> Self::Network {
        PeerClient {
            source: self.source,
            target,
            member: node.clone(),
            transport: Arc::clone(&self.transport),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

pub(crate) struct PeerClient {
    source: RaftId,
    target: RaftId,
    member: Member,
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl PeerClient {
    async fn call<E: std::error::Error>(
        &self,
        action: RPCTypes,
        request: RaftRequest,
        option: &RPCOption,
    ) -> Result<RaftResponse, RPCError<RaftId, Member, RaftError<RaftId, E>>> {
        let deadline = self.rpc_timeout.min(option.hard_ttl());
        trace!(target = %self.member, rpc = request.kind(), "sending raft rpc");
        let sent = self
            .transport
            .send(&self.member.name, &self.member.addr, request);
        match tokio::time::timeout(deadline, sent).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(self.transport_err(action, deadline, err)),
            Err(_) => Err(self.transport_err(action, deadline, TransportError::Timeout)),
        }
    }

    fn transport_err<E: std::error::Error>(
        &self,
        action: RPCTypes,
        deadline: Duration,
        err: TransportError,
    ) -> RPCError<RaftId, Member, RaftError<RaftId, E>> {
        match err {
            TransportError::Timeout => RPCError::Timeout(Timeout {
                action,
                id: self.source,
                target: self.target,
                timeout: deadline,
            }),
            TransportError::Unreachable(_) | TransportError::Closed | TransportError::Io(_) => {
                RPCError::Unreachable(Unreachable::new(&err))
            }
            TransportError::Codec(_) | TransportError::FrameTooLarge(_) | TransportError::Remote(_) => {
                RPCError::Network(NetworkError::new(&err))
            }
        }
    }

    fn remote<T, E: std::error::Error>(&self, result: Result<T, RaftError<RaftId, E>>) -> RpcResult<T, E> {
        result.map_err(|e| RPCError::RemoteError(RemoteError::new_with_node(self.target, self.member.clone(), e)))
    }

    fn mismatched<E: std::error::Error>(&self, response: &RaftResponse) -> RPCError<RaftId, Member, RaftError<RaftId, E>> {
        let err = TransportError::Remote(format!("{} answered with an unexpected response: {response:?}", self.member));
        RPCError::Network(NetworkError::new(&err))
    }
}

impl RaftNetwork<TypeConfig> for PeerClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<RaftId>> {
        match self
            .call(RPCTypes::AppendEntries, RaftRequest::Append(rpc), &option)
            .await?
        {
            RaftResponse::Append(result) => self.remote(result),
            other => Err(self.mismatched(&other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<RaftId>, InstallSnapshotError> {
        match self
            .call(RPCTypes::InstallSnapshot, RaftRequest::InstallSnapshot(rpc), &option)
            .await?
        {
            RaftResponse::InstallSnapshot(result) => self.remote(result),
            other => Err(self.mismatched(&other)),
        }
    }

    async fn vote(&mut self, rpc: VoteRequest<RaftId>, option: RPCOption) -> RpcResult<VoteResponse<RaftId>> {
        match self.call(RPCTypes::Vote, RaftRequest::Vote(rpc), &option).await? {
            RaftResponse::Vote(result) => self.remote(result),
            other => Err(self.mismatched(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use openraft::Vote;

    use super::*;
    use crate::domain::NodeId;

    struct Scripted(fn() -> Result<RaftResponse, TransportError>);

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _: &NodeId, _: &str, _: RaftRequest) -> Result<RaftResponse, TransportError> {
            (self.0)()
        }
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn send(&self, _: &NodeId, _: &str, _: RaftRequest) -> Result<RaftResponse, TransportError> {
            std::future::pending().await
        }
    }

    async fn client(transport: Arc<dyn Transport>) -> PeerClient {
        let mut network = Network::new(1, transport, Duration::from_millis(50));
        network
            .new_client(2, &Member::new(NodeId::new("n2"), "mem://n2"))
            .await
    }

    fn vote_request() -> VoteRequest<RaftId> {
        VoteRequest::new(Vote::new(3, 1), None)
    }

    fn option() -> RPCOption {
        RPCOption::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn vote_reply_is_passed_through() {
        let mut peer = client(Arc::new(Scripted(|| {
            Ok(RaftResponse::Vote(Ok(VoteResponse::new(Vote::new(3, 1), None, true))))
        })))
        .await;

        let response = peer.vote(vote_request(), option()).await.unwrap();
        assert!(response.vote_granted);
    }

    #[tokio::test]
    async fn unreachable_peer_maps_to_unreachable() {
        let mut peer = client(Arc::new(Scripted(|| {
            Err(TransportError::Unreachable(NodeId::new("n2")))
        })))
        .await;

        let err = peer.vote(vote_request(), option()).await.unwrap_err();
        assert!(matches!(err, RPCError::Unreachable(_)));
    }

    #[tokio::test]
    async fn stalled_peer_times_out_at_rpc_timeout() {
        let mut peer = client(Arc::new(Stalled)).await;

        let err = peer.vote(vote_request(), option()).await.unwrap_err();
        match err {
            RPCError::Timeout(timeout) => {
                assert_eq!(timeout.target, 2);
                assert_eq!(timeout.timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_response_kind_is_a_network_error() {
        let mut peer = client(Arc::new(Scripted(|| {
            Ok(RaftResponse::Vote(Ok(VoteResponse::new(Vote::new(3, 1), None, false))))
        })))
        .await;

        let err = peer
            .append_entries(
                AppendEntriesRequest {
                    vote: Vote::new(3, 1),
                    prev_log_id: None,
                    entries: Vec::new(),
                    leader_commit: None,
                },
                option(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RPCError::Network(_)));
    }
}
