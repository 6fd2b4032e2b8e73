use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A lease row in the `distributed_locks` table.
///
/// Absent means unlocked. `expires_at` in the future means held; in the past
/// means stale and stealable by anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLock {
    pub lock_key: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewed_count: u32,
}

impl DistributedLock {
    pub fn new(
        lock_key: impl Into<String>,
        owner_id: impl Into<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lock_key: lock_key.into(),
            owner_id: owner_id.into(),
            acquired_at: now,
            expires_at,
            renewed_count: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner_id == owner && !self.is_expired(now)
    }
}

/// Replicated lock ownership as tracked by the state machine.
///
/// Unlike [`DistributedLock`] this has no expiry: it is released only by an
/// explicit `lock_release` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
}
