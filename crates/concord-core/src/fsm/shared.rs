use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::{ApplyError, Command, LockRecord, SessionData, TaskId};

use super::ClusterState;

/// Synchronized handle to the node's [`ClusterState`].
///
/// Mutation is crate-private: only the consensus apply loop (and snapshot
/// restore) writes. Readers receive owned copies and never see the live maps.
#[derive(Debug, Clone, Default)]
pub struct SharedFsm {
    inner: Arc<RwLock<ClusterState>>,
}

impl SharedFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&self, command: &Command) -> Result<(), ApplyError> {
        self.write().apply(command)
    }

    pub(crate) fn restore(&self, state: ClusterState) {
        *self.write() = state;
    }

    /// Full copy of the current state.
    pub fn state(&self) -> ClusterState {
        self.read().clone()
    }

    pub fn sessions(&self) -> Vec<SessionData> {
        self.read().sessions.values().cloned().collect()
    }

    pub fn session(&self, name: &str) -> Option<SessionData> {
        self.read().sessions.get(name).cloned()
    }

    pub fn assigned_session(&self, task_id: &TaskId) -> Option<String> {
        self.read().task_assignments.get(task_id).cloned()
    }

    pub fn task_assignments(&self) -> Vec<(TaskId, String)> {
        self.read()
            .task_assignments
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect()
    }

    pub fn lock_owner(&self, lock_key: &str) -> Option<String> {
        self.read().locks.get(lock_key).map(|l| l.owner_id.clone())
    }

    pub fn locks(&self) -> Vec<(String, LockRecord)> {
        self.read()
            .locks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // A panic while holding the lock cannot leave ClusterState half-applied
    // (apply validates before mutating), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, ClusterState> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClusterState> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
