//! RPC messages exchanged between consensus nodes.
//!
//! The payloads are openraft's own request and response types; the enums
//! only add a tag so one frame format carries all three RPCs.

use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use super::{RaftId, TypeConfig};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RaftRequest {
    Vote(VoteRequest<RaftId>),
    Append(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

impl RaftRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::Vote(_) => "vote",
            RaftRequest::Append(_) => "append",
            RaftRequest::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

/// The receiving node's answer, or the error its raft core returned.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "rpc", content = "body", rename_all = "snake_case")]
pub enum RaftResponse {
    Vote(Result<VoteResponse<RaftId>, RaftError<RaftId>>),
    Append(Result<AppendEntriesResponse<RaftId>, RaftError<RaftId>>),
    InstallSnapshot(Result<InstallSnapshotResponse<RaftId>, RaftError<RaftId, InstallSnapshotError>>),
}
