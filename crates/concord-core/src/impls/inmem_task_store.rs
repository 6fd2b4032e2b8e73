use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{DistributedTask, StoreError, TaskId, TaskStatus};
use crate::ports::TaskStore;

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<TaskId, DistributedTask>,
    by_key: HashMap<String, TaskId>,
}

impl Table {
    /// Apply `update` to an `assigned` row; `None` if the row is in any other state.
    fn update_assigned(
        &mut self,
        id: &TaskId,
        update: impl FnOnce(&mut DistributedTask),
    ) -> Result<Option<DistributedTask>, StoreError> {
        let task = self
            .rows
            .get_mut(id)
            .ok_or(StoreError::TaskNotFound(*id))?;
        if task.status != TaskStatus::Assigned {
            return Ok(None);
        }
        update(task);
        Ok(Some(task.clone()))
    }
}

/// In-process task table with a unique index on `idempotency_key`.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    table: Mutex<Table>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: DistributedTask) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        if table.by_key.contains_key(&task.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey(task.idempotency_key));
        }
        table.by_key.insert(task.idempotency_key.clone(), task.id);
        table.rows.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<DistributedTask>, StoreError> {
        Ok(self.table.lock().await.rows.get(id).cloned())
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<DistributedTask>, StoreError> {
        let table = self.table.lock().await;
        Ok(table
            .by_key
            .get(key)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<DistributedTask>, StoreError> {
        let table = self.table.lock().await;
        let mut pending: Vec<&DistributedTask> = table
            .rows
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn count(&self, status: TaskStatus) -> Result<usize, StoreError> {
        let table = self.table.lock().await;
        Ok(table.rows.values().filter(|t| t.status == status).count())
    }

    async fn try_assign(
        &self,
        id: &TaskId,
        session: &str,
        now: DateTime<Utc>,
        claim_expires_at: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        let mut table = self.table.lock().await;
        let task = table
            .rows
            .get_mut(id)
            .ok_or(StoreError::TaskNotFound(*id))?;
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        task.status = TaskStatus::Assigned;
        task.claimed_by = Some(session.to_string());
        task.claimed_at = Some(now);
        task.claim_expires_at = Some(claim_expires_at);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_completed(
        &self,
        id: &TaskId,
        result: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.table.lock().await.update_assigned(id, |task| {
            task.status = TaskStatus::Completed;
            task.result = result;
            task.updated_at = now;
        })
    }

    async fn requeue(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.table.lock().await.update_assigned(id, |task| {
            task.status = TaskStatus::Pending;
            task.retry_count += 1;
            task.last_error = Some(error.to_string());
            task.clear_claim();
            task.updated_at = now;
        })
    }

    async fn mark_failed(
        &self,
        id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        self.table.lock().await.update_assigned(id, |task| {
            task.status = TaskStatus::Failed;
            task.last_error = Some(error.to_string());
            task.clear_claim();
            task.updated_at = now;
        })
    }

    async fn list_expired_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DistributedTask>, StoreError> {
        let table = self.table.lock().await;
        let mut expired: Vec<DistributedTask> = table
            .rows
            .values()
            .filter(|t| t.is_claim_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.claim_expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn reset_expired_claim(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<DistributedTask>, StoreError> {
        let mut table = self.table.lock().await;
        let task = table
            .rows
            .get_mut(id)
            .ok_or(StoreError::TaskNotFound(*id))?;
        if !task.is_claim_expired(now) {
            return Ok(None);
        }
        task.status = TaskStatus::Pending;
        task.clear_claim();
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn reset_session_claims(
        &self,
        session: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DistributedTask>, StoreError> {
        let mut table = self.table.lock().await;
        let mut reset = Vec::new();
        for task in table.rows.values_mut().filter(|t| t.is_claimed_by(session)) {
            task.status = TaskStatus::Pending;
            task.clear_claim();
            task.updated_at = now;
            reset.push(task.clone());
        }
        Ok(reset)
    }
}
