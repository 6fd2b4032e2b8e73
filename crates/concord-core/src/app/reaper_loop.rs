//! ReaperLoop - 期限切れ claim / lock の回収
//!
//! どちらのスイープも leader だけが実行します。失敗はログに残して次の tick で再試行。
//!
//! # フロー
//! 1. `cleanup_expired_claims()`: lease 切れの `assigned` を `pending` に戻す
//! 2. `cleanup_expired()`: 期限切れのロック行を削除（最適化のみ）

use std::time::Duration;

use tracing::warn;

use crate::consensus::ConsensusNode;
use crate::queue::DistributedTaskQueue;

use super::periodic::PeriodicTask;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_claims: usize,
    pub expired_locks: usize,
}

#[derive(Clone)]
pub struct ReaperLoop {
    queue: DistributedTaskQueue,
    node: ConsensusNode,
}

impl ReaperLoop {
    pub fn new(queue: DistributedTaskQueue, node: ConsensusNode) -> Self {
        Self { queue, node }
    }

    pub async fn sweep_claims(&self) -> usize {
        if !self.node.is_leader() {
            return 0;
        }
        match self.queue.cleanup_expired_claims().await {
            Ok(reset) => reset,
            Err(err) => {
                warn!(error = %err, "expired claim sweep failed");
                0
            }
        }
    }

    pub async fn sweep_locks(&self) -> usize {
        if !self.node.is_leader() {
            return 0;
        }
        match self.queue.locks().cleanup_expired().await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "expired lock cleanup failed");
                0
            }
        }
    }

    pub async fn run_once(&self) -> ReapReport {
        ReapReport {
            expired_claims: self.sweep_claims().await,
            expired_locks: self.sweep_locks().await,
        }
    }

    /// Start both sweeps, each on its own schedule and stop signal.
    pub fn spawn(self, claim_interval: Duration, lock_interval: Duration) -> Vec<PeriodicTask> {
        let claims = self.clone();
        let locks = self;
        vec![
            PeriodicTask::every("claim-reaper", claim_interval, move || {
                let reaper = claims.clone();
                async move {
                    reaper.sweep_claims().await;
                }
            }),
            PeriodicTask::every("lock-cleanup", lock_interval, move || {
                let reaper = locks.clone();
                async move {
                    reaper.sweep_locks().await;
                }
            }),
        ]
    }
}
