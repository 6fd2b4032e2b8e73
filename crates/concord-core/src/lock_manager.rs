//! Distributed lock manager - `distributed_locks` 上のリース
//!
//! consensus とは独立で、正しさはストアのアトミックな upsert だけに依存します。
//!
//! # 状態
//! - 行なし: 未ロック
//! - `expires_at` が未来: 保持中
//! - `expires_at` が過去: 期限切れ（誰でも奪える）

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::domain::{DistributedLock, LockError};
use crate::ports::{Clock, LockStore};

/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Acquire, renew or steal `lock_key` for `ttl`.
    ///
    /// Returns `false` when another owner holds an unexpired lease. Renewal by
    /// the current owner never shortens the lease.
    pub async fn acquire(&self, lock_key: &str, owner_id: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.try_acquire(lock_key, owner_id, ttl).await?.is_some())
    }

    /// Like [`acquire`](Self::acquire) but returns the resulting row.
    pub async fn try_acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<DistributedLock>, LockError> {
        if lock_key.is_empty() {
            return Err(LockError::EmptyKey);
        }
        if owner_id.is_empty() {
            return Err(LockError::EmptyOwner);
        }
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl(ttl));
        }
        let ttl_chrono = chrono::Duration::from_std(ttl).map_err(|_| LockError::InvalidTtl(ttl))?;

        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl_chrono)
            .ok_or(LockError::InvalidTtl(ttl))?;
        let lock = self.store.upsert(lock_key, owner_id, now, expires_at).await?;
        match &lock {
            Some(lock) => debug!(lock_key, owner = owner_id, renewed = lock.renewed_count, "lock acquired"),
            None => debug!(lock_key, owner = owner_id, "lock contended"),
        }
        Ok(lock)
    }

    /// Release only if `owner_id` holds the lock; otherwise a silent `false`.
    pub async fn release(&self, lock_key: &str, owner_id: &str) -> Result<bool, LockError> {
        let released = self.store.delete_if_owner(lock_key, owner_id).await?;
        if released {
            debug!(lock_key, owner = owner_id, "lock released");
        }
        Ok(released)
    }

    pub async fn is_locked(&self, lock_key: &str) -> Result<bool, LockError> {
        Ok(self.get_owner(lock_key).await?.is_some())
    }

    /// Owner of an unexpired lease.
    pub async fn get_owner(&self, lock_key: &str) -> Result<Option<String>, LockError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(lock_key)
            .await?
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.owner_id))
    }

    /// Raw row, expired or not.
    pub async fn get(&self, lock_key: &str) -> Result<Option<DistributedLock>, LockError> {
        Ok(self.store.get(lock_key).await?)
    }

    /// Delete expired rows. Correctness never depends on this running.
    pub async fn cleanup_expired(&self) -> Result<usize, LockError> {
        let removed = self.store.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "expired locks cleaned up");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryLockStore;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    fn manager() -> (DistributedLockManager, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let manager = DistributedLockManager::new(
            Arc::new(InMemoryLockStore::new()),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn second_owner_is_refused_until_expiry() {
        let (locks, clock) = manager();
        assert!(locks.acquire("job", "a", TTL).await.unwrap());
        assert!(!locks.acquire("job", "b", TTL).await.unwrap());
        assert_eq!(locks.get_owner("job").await.unwrap().as_deref(), Some("a"));

        clock.advance(chrono::Duration::seconds(30));
        assert!(!locks.is_locked("job").await.unwrap());
        assert!(locks.acquire("job", "b", TTL).await.unwrap());
        assert_eq!(locks.get_owner("job").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn renewal_extends_expiry_monotonically() {
        let (locks, clock) = manager();
        let first = locks.try_acquire("job", "a", TTL).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let renewed = locks.try_acquire("job", "a", TTL).await.unwrap().unwrap();
        assert!(renewed.expires_at > first.expires_at);
        assert_eq!(renewed.renewed_count, 1);

        let shorter = locks
            .try_acquire("job", "a", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shorter.expires_at, renewed.expires_at);
        assert_eq!(shorter.renewed_count, 2);
    }

    #[tokio::test]
    async fn release_by_non_owner_is_a_silent_false() {
        let (locks, _clock) = manager();
        locks.acquire("job", "a", TTL).await.unwrap();

        assert!(!locks.release("job", "b").await.unwrap());
        assert!(locks.is_locked("job").await.unwrap());
        assert!(locks.release("job", "a").await.unwrap());
        assert!(!locks.is_locked("job").await.unwrap());
        assert!(!locks.release("job", "a").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let (locks, clock) = manager();
        locks.acquire("short", "a", Duration::from_secs(1)).await.unwrap();
        locks.acquire("long", "a", Duration::from_secs(60)).await.unwrap();

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(locks.cleanup_expired().await.unwrap(), 1);
        assert!(locks.get("short").await.unwrap().is_none());
        assert!(locks.get("long").await.unwrap().is_some());
    }

    #[rstest]
    #[case("", "a", TTL, LockError::EmptyKey)]
    #[case("job", "", TTL, LockError::EmptyOwner)]
    #[case("job", "a", Duration::ZERO, LockError::InvalidTtl(Duration::ZERO))]
    #[tokio::test]
    async fn invalid_input_is_rejected(
        #[case] key: &str,
        #[case] owner: &str,
        #[case] ttl: Duration,
        #[case] expected: LockError,
    ) {
        let (locks, _clock) = manager();
        assert_eq!(locks.acquire(key, owner, ttl).await.unwrap_err(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_one_winner() {
        let (locks, _clock) = manager();
        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("job", &format!("owner-{i}"), TTL).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
