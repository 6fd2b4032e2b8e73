//! Distributed task queue - `distributed_tasks` の上のワークキュー
//!
//! # claim の二段構え
//! 1. 優先度順に pending を最大 N 件読む
//! 2. 候補ごとに `task:{id}` ロックを取り、取れたら行を条件付きで `assigned` にする
//! 3. 行の更新に負けたらロックを返して次の候補へ
//!
//! claim は consensus を通しません。ロックマネージャとストアの条件付き更新だけで
//! 同じタスクが 2 つのセッションに渡ることはありません。consensus が付いていれば
//! `task_assign` / `task_complete` を best-effort で記録します。記録は専用タスクが
//! 順番に適用するので、呼び出し側が consensus の commit を待つことはありません。

mod retry;


pub use retry::{FailureDecision, decide_failure};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::consensus::ConsensusNode;
use crate::domain::{
    Command, CommandOp, DEFAULT_MAX_RETRIES, DistributedTask, LockError, QueueError, TaskAssignment,
    TaskId, TaskRef, TaskStatus, TaskType,
};
use crate::lock_manager::DistributedLockManager;
use crate::ports::{Clock, IdGenerator, TaskStore};

/// Upper bound on rows touched by one expired-claim sweep.
const SWEEP_LIMIT: usize = 1000;

/// Bookkeeping commands waiting to be replicated; beyond this they are dropped.
const BOOKKEEPING_BACKLOG: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease length of a claim; also the ttl of the per-task lock.
    pub claim_timeout: Duration,
    /// Default retry budget for new tasks.
    pub max_retries: u32,
    /// Pending candidates read per claim.
    pub claim_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(10 * 60),
            max_retries: DEFAULT_MAX_RETRIES,
            claim_batch_size: 10,
        }
    }
}

/// Enqueue request with the optional knobs spelled out.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub priority: i32,
    /// Generated when `None`.
    pub idempotency_key: Option<String>,
    /// `QueueConfig::max_retries` when `None`.
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: TaskType, payload: Vec<u8>) -> Self {
        Self {
            task_type,
            payload,
            priority: 0,
            idempotency_key: None,
            max_retries: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.completed + self.failed
    }

    /// Nothing left to hand out or finish.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.assigned == 0
    }
}

pub fn lock_key(task_id: &TaskId) -> String {
    format!("task:{}", task_id.as_ulid())
}

/// Releases a freshly taken claim lock unless disarmed, so a claim future
/// dropped between "lock" and "assign" does not strand the task.
struct ClaimLockGuard {
    locks: DistributedLockManager,
    key: String,
    owner: String,
    armed: bool,
}

impl ClaimLockGuard {
    fn new(locks: DistributedLockManager, key: String, owner: &str, armed: bool) -> Self {
        Self {
            locks,
            key,
            owner: owner.to_string(),
            armed,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(err) = self.locks.release(&self.key, &self.owner).await {
            warn!(lock_key = %self.key, error = %err, "failed to release claim lock");
        }
    }
}

impl Drop for ClaimLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let locks = self.locks.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            if let Err(err) = locks.release(&key, &owner).await {
                warn!(lock_key = %key, error = %err, "failed to release abandoned claim lock");
            }
        });
    }
}

/// Cheap to clone; clones share stores and configuration.
#[derive(Clone)]
pub struct DistributedTaskQueue {
    store: Arc<dyn TaskStore>,
    locks: DistributedLockManager,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    bookkeeping: Option<mpsc::Sender<CommandOp>>,
}

impl DistributedTaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: DistributedLockManager,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            locks,
            ids,
            clock,
            config,
            bookkeeping: None,
        }
    }

    /// Record assignments in the replicated state when this node leads.
    /// Must be called inside a tokio runtime; the recorder task ends once
    /// every clone of the queue is dropped.
    pub fn with_consensus(mut self, node: ConsensusNode) -> Self {
        let (tx, rx) = mpsc::channel(BOOKKEEPING_BACKLOG);
        tokio::spawn(replicate_bookkeeping(node, Arc::clone(&self.clock), rx));
        self.bookkeeping = Some(tx);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn locks(&self) -> &DistributedLockManager {
        &self.locks
    }

    pub async fn enqueue(
        &self,
        task_type: TaskType,
        payload: Vec<u8>,
        priority: i32,
    ) -> Result<DistributedTask, QueueError> {
        self.enqueue_with(NewTask::new(task_type, payload).priority(priority))
            .await
    }

    /// Fails with `DuplicateIdempotencyKey` if the key already exists.
    pub async fn enqueue_with(&self, new: NewTask) -> Result<DistributedTask, QueueError> {
        let task = DistributedTask::new(
            self.ids.generate_task_id(),
            new.idempotency_key
                .unwrap_or_else(|| self.ids.generate_idempotency_key()),
            new.task_type,
            new.payload,
            new.priority,
            new.max_retries.unwrap_or(self.config.max_retries),
            self.clock.now(),
        );
        self.store.insert(task.clone()).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "task enqueued"
        );
        Ok(task)
    }

    /// Like [`enqueue_with`](Self::enqueue_with), but a known key returns the
    /// existing task instead of an error.
    pub async fn enqueue_idempotent(&self, new: NewTask) -> Result<DistributedTask, QueueError> {
        match self.enqueue_with(new).await {
            Err(QueueError::DuplicateIdempotencyKey(key)) => {
                let existing = self.store.get_by_idempotency_key(&key).await?;
                existing.ok_or(QueueError::DuplicateIdempotencyKey(key))
            }
            other => other,
        }
    }

    /// Hand the best pending task to `session`.
    ///
    /// # Errors
    /// - `NoClaimableTasks`: every candidate was taken or none exist
    pub async fn claim(&self, session: &str) -> Result<DistributedTask, QueueError> {
        let lease = chrono::Duration::from_std(self.config.claim_timeout)
            .map_err(|_| LockError::InvalidTtl(self.config.claim_timeout))?;
        let candidates = self.store.list_pending(self.config.claim_batch_size).await?;
        for candidate in candidates {
            let key = lock_key(&candidate.id);
            let attempt_started = self.clock.now();
            let Some(lock) = self
                .locks
                .try_acquire(&key, session, self.config.claim_timeout)
                .await?
            else {
                debug!(task_id = %candidate.id, session, "claim lock contended");
                continue;
            };
            // only a lease created by this attempt is ours to give back on failure
            let fresh = lock.acquired_at >= attempt_started;
            let guard = ClaimLockGuard::new(self.locks.clone(), key, session, fresh);

            let now = self.clock.now();
            let expires_at = now + lease;
            match self.store.try_assign(&candidate.id, session, now, expires_at).await {
                Ok(Some(task)) => {
                    guard.disarm();
                    info!(task_id = %task.id, session, "task claimed");
                    self.record(CommandOp::TaskAssign(TaskAssignment {
                        task_id: task.id,
                        session_name: session.to_string(),
                    }));
                    return Ok(task);
                }
                Ok(None) => {
                    debug!(task_id = %candidate.id, session, "lost claim race");
                    guard.release().await;
                }
                Err(err) => {
                    guard.release().await;
                    return Err(err.into());
                }
            }
        }
        Err(QueueError::NoClaimableTasks)
    }

    /// Mark an assigned task completed and release its lock.
    ///
    /// A session other than the claimant may complete the task; the lock
    /// release is then a no-op and the lease simply runs out.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        session: &str,
        result: Option<Vec<u8>>,
    ) -> Result<DistributedTask, QueueError> {
        let Some(task) = self
            .store
            .mark_completed(task_id, result, self.clock.now())
            .await?
        else {
            return Err(self.invalid_transition(task_id, session).await);
        };
        if task.claimed_by.as_deref() != Some(session) {
            warn!(task_id = %task_id, session, claimed_by = ?task.claimed_by, "task completed by a non-claimant");
        }
        self.release_claim_lock(task_id, session).await;
        info!(task_id = %task_id, session, "task completed");
        self.record(CommandOp::TaskComplete(TaskRef { task_id: *task_id }));
        Ok(task)
    }

    /// Report a failed attempt: requeue while retries remain, else fail terminally.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        session: &str,
        reason: &str,
    ) -> Result<DistributedTask, QueueError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(QueueError::NotFound(*task_id))?;
        if task.status != TaskStatus::Assigned {
            return Err(QueueError::InvalidTransition {
                task_id: *task_id,
                status: task.status,
                session: session.to_string(),
            });
        }

        let now = self.clock.now();
        let decision = decide_failure(&task);
        let updated = match decision {
            FailureDecision::Retry => self.store.requeue(task_id, reason, now).await?,
            FailureDecision::GiveUp => self.store.mark_failed(task_id, reason, now).await?,
        };
        let Some(updated) = updated else {
            return Err(self.invalid_transition(task_id, session).await);
        };

        self.release_claim_lock(task_id, session).await;
        match decision {
            FailureDecision::Retry => info!(
                task_id = %task_id,
                session,
                retry_count = updated.retry_count,
                reason,
                "task failed, requeued"
            ),
            FailureDecision::GiveUp => warn!(
                task_id = %task_id,
                session,
                retry_count = updated.retry_count,
                reason,
                "task failed permanently"
            ),
        }
        self.record(CommandOp::TaskComplete(TaskRef { task_id: *task_id }));
        Ok(updated)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<DistributedTask>, QueueError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus, QueueError> {
        self.store
            .get(task_id)
            .await?
            .map(|t| t.status)
            .ok_or(QueueError::NotFound(*task_id))
    }

    pub async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<DistributedTask>, QueueError> {
        Ok(self.store.get_by_idempotency_key(key).await?)
    }

    pub async fn get_pending_task_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.count(TaskStatus::Pending).await?)
    }

    pub async fn task_counts(&self) -> Result<TaskCounts, QueueError> {
        Ok(TaskCounts {
            pending: self.store.count(TaskStatus::Pending).await?,
            assigned: self.store.count(TaskStatus::Assigned).await?,
            completed: self.store.count(TaskStatus::Completed).await?,
            failed: self.store.count(TaskStatus::Failed).await?,
        })
    }

    /// Reset `assigned` tasks whose claim lease ran out back to `pending`.
    /// `retry_count` is not touched.
    pub async fn cleanup_expired_claims(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let expired = self.store.list_expired_claims(now, SWEEP_LIMIT).await?;
        let mut reset = 0;
        for task in expired {
            let Some(updated) = self.store.reset_expired_claim(&task.id, now).await? else {
                continue;
            };
            reset += 1;
            if let Some(session) = task.claimed_by.as_deref() {
                self.release_claim_lock(&task.id, session).await;
            }
            info!(task_id = %updated.id, claimed_by = ?task.claimed_by, "expired claim reset");
            self.record(CommandOp::TaskComplete(TaskRef { task_id: task.id }));
        }
        Ok(reset)
    }

    /// Return every task held by `session` to `pending` and drop its locks.
    pub async fn reassign_session_tasks(&self, session: &str) -> Result<Vec<TaskId>, QueueError> {
        let reset = self
            .store
            .reset_session_claims(session, self.clock.now())
            .await?;
        let mut ids = Vec::with_capacity(reset.len());
        for task in reset {
            self.release_claim_lock(&task.id, session).await;
            ids.push(task.id);
        }
        if !ids.is_empty() {
            info!(session, count = ids.len(), "session tasks returned to pending");
        }
        Ok(ids)
    }

    async fn release_claim_lock(&self, task_id: &TaskId, session: &str) {
        if let Err(err) = self.locks.release(&lock_key(task_id), session).await {
            warn!(task_id = %task_id, session, error = %err, "failed to release claim lock");
        }
    }

    async fn invalid_transition(&self, task_id: &TaskId, session: &str) -> QueueError {
        match self.store.get(task_id).await {
            Ok(Some(task)) => QueueError::InvalidTransition {
                task_id: *task_id,
                status: task.status,
                session: session.to_string(),
            },
            Ok(None) => QueueError::NotFound(*task_id),
            Err(err) => err.into(),
        }
    }

    /// Best-effort replicated bookkeeping; failures never affect the durable row.
    fn record(&self, op: CommandOp) {
        let Some(tx) = &self.bookkeeping else {
            return;
        };
        if let Err(err) = tx.try_send(op) {
            debug!(error = %err, "task bookkeeping dropped");
        }
    }
}

/// Applies queued bookkeeping in submission order, so an assignment is never
/// replicated after the completion that ends it.
async fn replicate_bookkeeping(node: ConsensusNode, clock: Arc<dyn Clock>, mut rx: mpsc::Receiver<CommandOp>) {
    while let Some(op) = rx.recv().await {
        if !node.is_leader() {
            continue;
        }
        let kind = op.command_type();
        let command = Command::new(node.id().clone(), clock.now(), op);
        if let Err(err) = node.apply(command).await {
            debug!(command = ?kind, error = %err, "task bookkeeping not replicated");
        }
    }
}
