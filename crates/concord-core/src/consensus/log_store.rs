//! openraft の `RaftLogStorage` を [`RaftStorage`] port の上に実装する
//!
//! エントリはメモリ上の BTreeMap にも保持し、読み出しはそこから返します。
//! 書き込みは port に書いてからキャッシュを更新します。

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::{Arc, Mutex, MutexGuard};

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{AnyError, OptionalSend, RaftLogReader, StorageIOError};

use super::storage::{HardState, PersistedState, RaftStorage};
use super::{LogEntry, LogId, LogIndex, RaftId, StorageError, TypeConfig, Vote};

type RaftStorageError = openraft::StorageError<RaftId>;

struct LogCache {
    hard_state: HardState,
    entries: BTreeMap<LogIndex, LogEntry>,
}

/// Clones share the cache; openraft uses one as its log reader.
#[derive(Clone)]
pub(crate) struct LogStore {
    storage: Arc<dyn RaftStorage>,
    cache: Arc<Mutex<LogCache>>,
}

impl LogStore {
    pub(crate) fn new(storage: Arc<dyn RaftStorage>, persisted: &PersistedState) -> Self {
        let entries = persisted
            .entries
            .iter()
            .map(|e| (e.log_id.index, e.clone()))
            .collect();
        Self {
            storage,
            cache: Arc::new(Mutex::new(LogCache {
                hard_state: persisted.hard_state.clone(),
                entries,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save_hard_state(&self, update: impl FnOnce(&mut HardState)) -> Result<(), StorageError> {
        let mut cache = self.lock();
        let mut next = cache.hard_state.clone();
        update(&mut next);
        self.storage.save_hard_state(&next)?;
        cache.hard_state = next;
        Ok(())
    }
}

fn write_err(err: StorageError) -> RaftStorageError {
    StorageIOError::write_logs(AnyError::new(&err)).into()
}

fn vote_err(err: StorageError) -> RaftStorageError {
    StorageIOError::write_vote(AnyError::new(&err)).into()
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, RaftStorageError> {
        Ok(self.lock().entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError> {
        let cache = self.lock();
        let last_purged_log_id = cache.hard_state.last_purged;
        let last_log_id = cache
            .entries
            .values()
            .next_back()
            .map(|e| e.log_id)
            .or(last_purged_log_id);
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), RaftStorageError> {
        let vote = *vote;
        self.save_hard_state(|hs| hs.vote = Some(vote)).map_err(vote_err)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, RaftStorageError> {
        Ok(self.lock().hard_state.vote)
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), RaftStorageError> {
        self.save_hard_state(|hs| hs.committed = committed).map_err(write_err)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, RaftStorageError> {
        Ok(self.lock().hard_state.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), RaftStorageError>
    where
        I: IntoIterator<Item = LogEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<LogEntry> = entries.into_iter().collect();
        {
            let mut cache = self.lock();
            self.storage.append(&entries).map_err(write_err)?;
            cache
                .entries
                .extend(entries.into_iter().map(|e| (e.log_id.index, e)));
        }
        // the port writes synchronously, so the entries are durable here
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), RaftStorageError> {
        let mut cache = self.lock();
        self.storage.truncate_from(log_id.index).map_err(write_err)?;
        cache.entries.retain(|index, _| *index < log_id.index);
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), RaftStorageError> {
        // record the purge point first; load() drops anything behind it
        self.save_hard_state(|hs| hs.last_purged = Some(log_id))
            .map_err(write_err)?;
        let mut cache = self.lock();
        self.storage.purge_through(log_id.index).map_err(write_err)?;
        cache.entries.retain(|index, _| *index > log_id.index);
        Ok(())
    }
}
