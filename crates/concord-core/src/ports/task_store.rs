//! TaskStore port - `distributed_tasks` テーブル
//!
//! # 設計原則
//! - `idempotency_key` はユニーク制約（重複 insert はストアが拒否する）
//! - 状態遷移は全て「期待する状態なら更新」の条件付き更新。
//!   条件を満たさなければ `Ok(None)` を返し、呼び出し側が次の候補へ進む
//! - claim の排他はロックマネージャとこの条件付き更新の二段構え

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DistributedTask, StoreError, TaskId, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fails with `DuplicateIdempotencyKey` if the key is taken.
    async fn insert(&self, task: DistributedTask) -> Result<(), StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<DistributedTask>, StoreError>;

    async fn get_by_idempotency_key(&self, key: &str)
    -> Result<Option<DistributedTask>, StoreError>;

    /// Up to `limit` pending tasks, highest priority first, then oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<DistributedTask>, StoreError>;

    async fn count(&self, status: TaskStatus) -> Result<usize, StoreError>;

    /// `pending` → `assigned` to `session`, only if still pending.
    async fn try_assign(
        &self,
        id: &TaskId,
        session: &str,
        now: DateTime<Utc>,
        claim_expires_at: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError>;

    /// `assigned` → `completed`, only if assigned.
    async fn mark_completed(
        &self,
        id: &TaskId,
        result: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError>;

    /// `assigned` → `pending` with `retry_count + 1`, only if assigned.
    async fn requeue(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError>;

    /// `assigned` → terminal `failed`, only if assigned.
    async fn mark_failed(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError>;

    /// Assigned tasks whose claim expired at `now`.
    async fn list_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DistributedTask>, StoreError>;

    /// `assigned` → `pending` if the claim is still expired at `now`.
    /// `retry_count` is left alone.
    async fn reset_expired_claim(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError>;

    /// Every task assigned to `session` back to `pending`. Returns the reset tasks.
    async fn reset_session_claims(
        &self,
        session: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DistributedTask>, StoreError>;
}
