//! Errors - ドメインエラー
//!
//! # 分類
//! - [`ApplyError`]: ステートマシンが拒否したコマンド（結果として返す、レプリケーション失敗ではない）
//! - [`StoreError`]: 永続ストアの失敗（一時的、次の tick で再試行）
//! - [`LockError`]: ロックマネージャの入力エラー
//! - [`QueueError`]: タスクキュー操作の失敗
//! - [`SessionError`]: セッション登録・ヘルスチェックの失敗

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{TaskId, TaskStatus};
use crate::consensus::ConsensusError;

/// A command the state machine refused. State is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ApplyError {
    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("invalid command: {0}")]
    Invalid(String),

    #[error("session not registered: {0}")]
    UnknownSession(String),

    #[error("session {0} is failed")]
    SessionFailed(String),

    #[error("session {session} is at capacity ({max} tasks)")]
    SessionAtCapacity { session: String, max: u32 },

    #[error("task {task_id} already assigned to session {session}")]
    TaskAlreadyAssigned { task_id: TaskId, session: String },

    #[error("task {0} is not assigned")]
    TaskNotAssigned(TaskId),

    #[error("lock {lock_key} is held by {owner}")]
    LockHeld { lock_key: String, owner: String },

    #[error("lock {lock_key} is not owned by {owner}")]
    NotLockOwner { lock_key: String, owner: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock key must not be empty")]
    EmptyKey,

    #[error("lock owner must not be empty")]
    EmptyOwner,

    #[error("lock ttl out of range: {0:?}")]
    InvalidTtl(std::time::Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Every candidate was exhausted; there is nothing to hand out right now.
    #[error("no claimable tasks")]
    NoClaimableTasks,

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("task {task_id} is {status}, not assigned to {session}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        session: String,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Lock(LockError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdempotencyKey(key) => QueueError::DuplicateIdempotencyKey(key),
            StoreError::TaskNotFound(id) => QueueError::NotFound(id),
            other => QueueError::Store(other),
        }
    }
}

impl From<LockError> for QueueError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Store(store) => store.into(),
            other => QueueError::Lock(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session registration: {0}")]
    InvalidRegistration(&'static str),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
