use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{DistributedLock, StoreError};
use crate::ports::LockStore;

/// In-process lock table. Clones do not share state; wrap in `Arc` to share.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    rows: Mutex<HashMap<String, DistributedLock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, expired ones included.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn upsert(
        &self,
        lock_key: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<DistributedLock>, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(lock_key) {
            None => {
                let lock = DistributedLock::new(lock_key, owner_id, now, expires_at);
                rows.insert(lock_key.to_string(), lock.clone());
                Ok(Some(lock))
            }
            Some(lock) if lock.owner_id == owner_id => {
                lock.expires_at = lock.expires_at.max(expires_at);
                lock.renewed_count += 1;
                Ok(Some(lock.clone()))
            }
            Some(lock) if lock.is_expired(now) => {
                *lock = DistributedLock::new(lock_key, owner_id, now, expires_at);
                Ok(Some(lock.clone()))
            }
            Some(_) => Ok(None),
        }
    }

    async fn delete_if_owner(&self, lock_key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.get(lock_key).is_some_and(|l| l.owner_id == owner_id) {
            rows.remove(lock_key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, lock_key: &str) -> Result<Option<DistributedLock>, StoreError> {
        Ok(self.rows.lock().await.get(lock_key).cloned())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, lock| !lock.is_expired(now));
        Ok(before - rows.len())
    }
}
