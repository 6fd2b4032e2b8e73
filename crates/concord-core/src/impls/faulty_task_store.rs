//! A [`TaskStore`] that fails a set number of calls before delegating to
//! [`InMemoryTaskStore`]. Used to drive the error paths in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DistributedTask, StoreError, TaskId, TaskStatus};
use crate::impls::InMemoryTaskStore;
use crate::ports::TaskStore;

#[derive(Default)]
pub struct FaultyTaskStore {
    inner: InMemoryTaskStore,
    assign_failures: AtomicUsize,
    reset_failures: AtomicUsize,
}

impl FaultyTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `try_assign` fail.
    pub fn fail_assigns(self, n: usize) -> Self {
        self.assign_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` calls to `reset_session_claims` fail.
    pub fn fail_resets(self, n: usize) -> Self {
        self.reset_failures.store(n, Ordering::SeqCst);
        self
    }

    fn trip(counter: &AtomicUsize) -> Result<(), StoreError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::Unavailable("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TaskStore for FaultyTaskStore {
    async fn insert(&self, task: DistributedTask) -> Result<(), StoreError> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.get(id).await
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.get_by_idempotency_key(key).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<DistributedTask>, StoreError> {
        self.inner.list_pending(limit).await
    }

    async fn count(&self, status: TaskStatus) -> Result<usize, StoreError> {
        self.inner.count(status).await
    }

    async fn try_assign(
        &self,
        id: &TaskId,
        session: &str,
        now: DateTime<Utc>,
        claim_expires_at: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        Self::trip(&self.assign_failures)?;
        self.inner.try_assign(id, session, now, claim_expires_at).await
    }

    async fn mark_completed(
        &self,
        id: &TaskId,
        result: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.mark_completed(id, result, now).await
    }

    async fn requeue(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.requeue(id, error, now).await
    }

    async fn mark_failed(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.mark_failed(id, error, now).await
    }

    async fn list_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DistributedTask>, StoreError> {
        self.inner.list_expired_claims(now, limit).await
    }

    async fn reset_expired_claim(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.inner.reset_expired_claim(id, now).await
    }

    async fn reset_session_claims(
        &self,
        session: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DistributedTask>, StoreError> {
        Self::trip(&self.reset_failures)?;
        self.inner.reset_session_claims(session, now).await
    }
}
