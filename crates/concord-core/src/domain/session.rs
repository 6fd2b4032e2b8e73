//! Session - クラスタに参加するワーカープロセス
//!
//! セッションは `session_register` コマンドで生成され、削除されません。
//! 存在しない = 一度も登録されていない、という意味になります。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default capacity when a registration does not specify one.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 5;

/// SessionStatus はセッションの状態
///
/// # 状態遷移
/// - idle: 登録直後 / heartbeat 受信後
/// - busy: タスク割り当て中
/// - failed: health check で lease 切れと判定された
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Replicated view of one registered session.
///
/// `registered_at` / `last_heartbeat` come from the command timestamp, never
/// from the applying node's clock, so every replica holds identical values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_name: String,
    pub tier: String,
    pub provider: String,
    pub status: SessionStatus,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionData {
    pub fn is_failed(&self) -> bool {
        self.status == SessionStatus::Failed
    }
}
