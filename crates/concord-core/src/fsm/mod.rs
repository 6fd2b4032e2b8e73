//! Replicated state machine.
//!
//! [`ClusterState`] は純粋な状態遷移のみを持ちます（I/O なし、時計なし）。
//! 同じコマンド列を適用すれば、どのノードでも同じ状態になります。
//!
//! # 所有権
//! - 書き込み: consensus ノードの apply ループだけが [`SharedFsm`] 経由で行う
//! - 読み取り: [`SharedFsm`] のスナップショットアクセサ（owned な値を返す）

mod shared;

pub use shared::SharedFsm;

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::domain::{
    ApplyError, Command, CommandOp, DEFAULT_MAX_CONCURRENT_TASKS, LockOwnership, LockRecord,
    SessionData, SessionRef, SessionRegistration, SessionStatus, TaskAssignment, TaskId,
};

/// Sessions, task assignments and lock ownership as agreed by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub sessions: BTreeMap<String, SessionData>,
    pub task_assignments: BTreeMap<TaskId, String>,
    pub locks: BTreeMap<String, LockRecord>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one command. On `Err` the state is unchanged.
    pub fn apply(&mut self, command: &Command) -> Result<(), ApplyError> {
        let at = command.timestamp;
        match &command.op {
            CommandOp::SessionRegister(reg) => self.register_session(reg, at),
            CommandOp::SessionHeartbeat(SessionRef { session_name }) => {
                let session = self.session_mut(session_name)?;
                session.last_heartbeat = at;
                session.status = SessionStatus::Idle;
                Ok(())
            }
            CommandOp::SessionFailure(SessionRef { session_name }) => {
                self.session_mut(session_name)?.status = SessionStatus::Failed;
                self.task_assignments.retain(|_, owner| owner != session_name);
                Ok(())
            }
            CommandOp::TaskAssign(assignment) => self.assign_task(assignment),
            CommandOp::TaskComplete(task) => self.complete_task(&task.task_id),
            CommandOp::LockAcquire(LockOwnership { lock_key, owner_id }) => {
                if lock_key.is_empty() {
                    return Err(ApplyError::Invalid("empty lock_key".into()));
                }
                match self.locks.get(lock_key) {
                    Some(lock) if lock.owner_id == *owner_id => Ok(()),
                    Some(lock) => Err(ApplyError::LockHeld {
                        lock_key: lock_key.clone(),
                        owner: lock.owner_id.clone(),
                    }),
                    None => {
                        self.locks.insert(
                            lock_key.clone(),
                            LockRecord {
                                owner_id: owner_id.clone(),
                                acquired_at: at,
                            },
                        );
                        Ok(())
                    }
                }
            }
            CommandOp::LockRelease(LockOwnership { lock_key, owner_id }) => {
                match self.locks.get(lock_key) {
                    None => Ok(()),
                    Some(lock) if lock.owner_id != *owner_id => Err(ApplyError::NotLockOwner {
                        lock_key: lock_key.clone(),
                        owner: owner_id.clone(),
                    }),
                    Some(_) => {
                        self.locks.remove(lock_key);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Decode and apply a wire-format command.
    pub fn apply_encoded(&mut self, bytes: &[u8]) -> Result<(), ApplyError> {
        let command = Command::decode(bytes).map_err(|e| ApplyError::Malformed(e.to_string()))?;
        self.apply(&command)
    }

    pub fn assigned_task_count(&self, session_name: &str) -> usize {
        self.task_assignments
            .values()
            .filter(|owner| owner.as_str() == session_name)
            .count()
    }

    pub fn write_snapshot<W: Write>(&self, writer: W) -> Result<(), serde_json::Error> {
        serde_json::to_writer(writer, self)
    }

    pub fn read_snapshot<R: Read>(reader: R) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(reader)
    }

    fn session_mut(&mut self, name: &str) -> Result<&mut SessionData, ApplyError> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| ApplyError::UnknownSession(name.to_string()))
    }

    fn register_session(
        &mut self,
        reg: &SessionRegistration,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ApplyError> {
        if reg.session_name.trim().is_empty() {
            return Err(ApplyError::Invalid("empty session_name".into()));
        }
        let max_concurrent_tasks = if reg.max_concurrent_tasks == 0 {
            DEFAULT_MAX_CONCURRENT_TASKS
        } else {
            reg.max_concurrent_tasks
        };
        // re-registration keeps the original registration time
        let registered_at = self
            .sessions
            .get(&reg.session_name)
            .map_or(at, |existing| existing.registered_at);

        self.sessions.insert(
            reg.session_name.clone(),
            SessionData {
                session_name: reg.session_name.clone(),
                tier: reg.tier.clone(),
                provider: reg.provider.clone(),
                status: SessionStatus::Idle,
                max_concurrent_tasks,
                metadata: reg.metadata.clone(),
                registered_at,
                last_heartbeat: at,
            },
        );
        Ok(())
    }

    fn assign_task(&mut self, assignment: &TaskAssignment) -> Result<(), ApplyError> {
        let TaskAssignment {
            task_id,
            session_name,
        } = assignment;

        let session = self
            .sessions
            .get(session_name)
            .ok_or_else(|| ApplyError::UnknownSession(session_name.clone()))?;
        if session.is_failed() {
            return Err(ApplyError::SessionFailed(session_name.clone()));
        }
        match self.task_assignments.get(task_id) {
            Some(owner) if owner == session_name => return Ok(()),
            Some(owner) => {
                return Err(ApplyError::TaskAlreadyAssigned {
                    task_id: *task_id,
                    session: owner.clone(),
                });
            }
            None => {}
        }
        let max = session.max_concurrent_tasks;
        if self.assigned_task_count(session_name) >= max as usize {
            return Err(ApplyError::SessionAtCapacity {
                session: session_name.clone(),
                max,
            });
        }

        self.task_assignments.insert(*task_id, session_name.clone());
        self.session_mut(session_name)?.status = SessionStatus::Busy;
        Ok(())
    }

    fn complete_task(&mut self, task_id: &TaskId) -> Result<(), ApplyError> {
        let owner = self
            .task_assignments
            .remove(task_id)
            .ok_or(ApplyError::TaskNotAssigned(*task_id))?;

        let remaining = self.assigned_task_count(&owner);
        if let Some(session) = self.sessions.get_mut(&owner)
            && remaining == 0
            && session.status == SessionStatus::Busy
        {
            session.status = SessionStatus::Idle;
        }
        Ok(())
    }
}
