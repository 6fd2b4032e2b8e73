//! LockStore port - `distributed_locks` テーブル
//!
//! `lock_key` がユニーク。各操作は単一のアトミックな文で実行されること
//! （SQL なら `INSERT ... ON CONFLICT DO UPDATE ... WHERE`）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DistributedLock, StoreError};

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert, renew or steal `lock_key` in one atomic step.
    ///
    /// - absent: insert with `renewed_count = 0`
    /// - held by `owner`: extend `expires_at` (never backwards), `renewed_count + 1`
    /// - held by someone else but expired at `now`: take over, `renewed_count = 0`
    /// - otherwise: leave the row alone and return `None`
    async fn upsert(
        &self,
        lock_key: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<DistributedLock>, StoreError>;

    /// Delete the row only if `owner_id` matches. Returns whether a row was deleted.
    async fn delete_if_owner(&self, lock_key: &str, owner_id: &str) -> Result<bool, StoreError>;

    async fn get(&self, lock_key: &str) -> Result<Option<DistributedLock>, StoreError>;

    /// Bulk-delete rows with `expires_at <= now`. Returns how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
