//! Retry decision for failed tasks.
//!
//! Pure judgment, no I/O: the queue reads the task, asks here, then performs
//! the matching conditional update.

use crate::domain::DistributedTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to `pending` with `retry_count + 1`.
    Retry,
    /// Terminal `failed`.
    GiveUp,
}

/// `max_retries = 3` means the fourth failure is terminal.
pub fn decide_failure(task: &DistributedTask) -> FailureDecision {
    if task.retry_count < task.max_retries {
        FailureDecision::Retry
    } else {
        FailureDecision::GiveUp
    }
}
