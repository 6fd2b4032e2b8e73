//! openraft の `RaftStateMachine` - コミット済みエントリを [`SharedFsm`] に適用する
//!
//! # スナップショット
//! - build: FSM 全体を JSON にして `RaftStorage::save_snapshot` で保存
//! - install: 受け取った JSON で FSM を丸ごと置き換える
//! - 起動時: 保存済みスナップショットがあれば FSM をそこから復元し、
//!   openraft が残りのログを再生する

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use openraft::storage::RaftStateMachine;
use openraft::{AnyError, EntryPayload, OptionalSend, RaftSnapshotBuilder, StorageIOError};
use tracing::{debug, info};

use crate::fsm::SharedFsm;

use super::storage::RaftStorage;
use super::{
    CommandResult, LogEntry, LogId, RaftId, RaftSnapshotMeta, Snapshot, StorageError,
    StoredMembership, TypeConfig,
};

type RaftStorageError = openraft::StorageError<RaftId>;

#[derive(Default)]
struct Applied {
    last_applied: Option<LogId>,
    membership: StoredMembership,
    snapshot: Option<Snapshot>,
    snapshot_seq: u64,
}

/// Clones share the same applied state; the node handle keeps one to read
/// the current snapshot.
#[derive(Clone)]
pub(crate) struct StateMachineStore {
    fsm: SharedFsm,
    storage: Arc<dyn RaftStorage>,
    applied: Arc<Mutex<Applied>>,
}

impl StateMachineStore {
    pub(crate) fn new(fsm: SharedFsm, storage: Arc<dyn RaftStorage>, snapshot: Option<Snapshot>) -> Self {
        let mut applied = Applied::default();
        if let Some(snapshot) = snapshot {
            info!(last_log_id = ?snapshot.meta.last_log_id, "restoring state machine from snapshot");
            fsm.restore(snapshot.state.clone());
            applied.last_applied = snapshot.meta.last_log_id;
            applied.membership = snapshot.meta.last_membership.clone();
            applied.snapshot = Some(snapshot);
        }
        Self {
            fsm,
            storage,
            applied: Arc::new(Mutex::new(applied)),
        }
    }

    /// Most recent snapshot built or installed on this node.
    pub(crate) fn current_snapshot(&self) -> Option<Snapshot> {
        self.lock().snapshot.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Applied> {
        self.applied.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn keep_snapshot(&self, applied: &mut Applied, snapshot: Snapshot) -> Result<(), StorageError> {
        self.storage.save_snapshot(&snapshot)?;
        applied.snapshot = Some(snapshot);
        Ok(())
    }
}

fn snapshot_err(meta: Option<&RaftSnapshotMeta>, err: impl std::error::Error + 'static) -> RaftStorageError {
    StorageIOError::write_snapshot(meta.map(|m| m.signature()), AnyError::new(&err)).into()
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<openraft::Snapshot<TypeConfig>, RaftStorageError> {
        let mut applied = self.lock();
        // state and last_applied only change under this lock, so they match
        let state = self.fsm.state();
        applied.snapshot_seq += 1;
        let meta = RaftSnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership.clone(),
            snapshot_id: format!(
                "{}-{}",
                applied.last_applied.map_or(0, |id| id.index),
                applied.snapshot_seq
            ),
        };
        let snapshot = Snapshot { meta, state };
        let raft = snapshot.to_raft().map_err(|e| snapshot_err(Some(&snapshot.meta), e))?;
        self.keep_snapshot(&mut applied, snapshot)
            .map_err(|e| snapshot_err(Some(&raft.meta), e))?;
        debug!(snapshot_id = %raft.meta.snapshot_id, "snapshot built");
        Ok(raft)
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), RaftStorageError> {
        let applied = self.lock();
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResult>, RaftStorageError>
    where
        I: IntoIterator<Item = LogEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut applied = self.lock();
        let mut results = Vec::new();
        for entry in entries {
            applied.last_applied = Some(entry.log_id);
            let result = match entry.payload {
                EntryPayload::Blank => CommandResult::ok(),
                EntryPayload::Normal(command) => {
                    let outcome = self.fsm.apply(&command);
                    if let Err(err) = &outcome {
                        debug!(index = entry.log_id.index, error = %err, "command rejected by state machine");
                    }
                    CommandResult(outcome)
                }
                EntryPayload::Membership(membership) => {
                    applied.membership = StoredMembership::new(Some(entry.log_id), membership);
                    CommandResult::ok()
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, RaftStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), RaftStorageError> {
        let snapshot = Snapshot::from_raft(meta.clone(), snapshot.get_ref())
            .map_err(|e| snapshot_err(Some(meta), e))?;
        let mut applied = self.lock();
        self.fsm.restore(snapshot.state.clone());
        applied.last_applied = meta.last_log_id;
        applied.membership = meta.last_membership.clone();
        self.keep_snapshot(&mut applied, snapshot)
            .map_err(|e| snapshot_err(Some(meta), e))?;
        info!(last_log_id = ?meta.last_log_id, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<openraft::Snapshot<TypeConfig>>, RaftStorageError> {
        let current = self.lock().snapshot.clone();
        current
            .map(|s| s.to_raft().map_err(|e| snapshot_err(Some(&s.meta), e)))
            .transpose()
    }
}
