use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TaskId;

/// Default number of retries before a task becomes terminally failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// TaskStatus は durable なタスクの状態
///
/// # 状態遷移
/// - pending →(claim)→ assigned →(complete)→ completed
/// - assigned →(fail, retry 残あり)→ pending（retry_count + 1）
/// - assigned →(fail, retry 上限)→ failed
/// - assigned →(claim 期限切れ)→ pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable unit of work, persisted in the `distributed_tasks` table.
///
/// Claim fields (`claimed_by`, `claimed_at`, `claim_expires_at`) are set
/// together while the task is `assigned` and cleared together on requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedTask {
    pub id: TaskId,
    pub idempotency_key: String,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub result: Option<Vec<u8>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DistributedTask {
    /// A fresh `pending` task.
    pub fn new(
        id: TaskId,
        idempotency_key: impl Into<String>,
        task_type: TaskType,
        payload: Vec<u8>,
        priority: i32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            idempotency_key: idempotency_key.into(),
            task_type,
            payload,
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            claimed_by: None,
            claimed_at: None,
            claim_expires_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimed_by(&self, session: &str) -> bool {
        self.status == TaskStatus::Assigned && self.claimed_by.as_deref() == Some(session)
    }

    pub fn is_claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Assigned
            && self.claim_expires_at.is_some_and(|expires| expires <= now)
    }

    pub(crate) fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
        self.claim_expires_at = None;
    }
}
