//! RaftStorage port - ノードごとの永続状態
//!
//! # 永続化するもの
//! - hard state: vote / committed / last_purged（openraft が変更を通知するたびに保存）
//! - log: append-only のエントリ列
//! - snapshot: ログ先頭部分を置き換える FSM 全体のイメージ
//!
//! openraft 側のアダプタ（`LogStore` / `StateMachineStore`）がこの port を通して
//! 書き込みます。
//!
//! # 実装
//! - **MemStorage**: テスト用。clone すると同じ状態を共有するので、
//!   「クラッシュしたノード」を同じ状態で再起動できる
//! - **FileStorage**: `hard_state.json`, `log.jsonl`, `snapshot.json`

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{LogEntry, LogId, LogIndex, Snapshot, StorageError, Vote};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub vote: Option<Vote>,
    pub committed: Option<LogId>,
    /// Highest entry removed from the log; everything up to it is covered
    /// by the snapshot.
    pub last_purged: Option<LogId>,
}

/// Everything a node needs to resume after a restart.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Entries after `hard_state.last_purged`, contiguous.
    pub entries: Vec<LogEntry>,
}

pub trait RaftStorage: Send + Sync + 'static {
    fn load(&self) -> Result<PersistedState, StorageError>;

    fn save_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError>;

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove `index` and every later entry.
    fn truncate_from(&self, index: LogIndex) -> Result<(), StorageError>;

    /// Remove `index` and every earlier entry.
    fn purge_through(&self, index: LogIndex) -> Result<(), StorageError>;

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<PersistedState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RaftStorage for MemStorage {
    fn load(&self) -> Result<PersistedState, StorageError> {
        Ok(self.lock().clone())
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError> {
        self.lock().hard_state = hard_state.clone();
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<(), StorageError> {
        self.lock().entries.retain(|e| e.log_id.index < index);
        Ok(())
    }

    fn purge_through(&self, index: LogIndex) -> Result<(), StorageError> {
        self.lock().entries.retain(|e| e.log_id.index > index);
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.lock().snapshot = Some(snapshot.clone());
        Ok(())
    }
}

const HARD_STATE_FILE: &str = "hard_state.json";
const LOG_FILE: &str = "log.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// File-backed storage under one directory per node.
///
/// Whole-file writes go through a temp file and `rename`, so a crash leaves
/// either the old or the new version. The log is JSON lines; a torn final
/// line is dropped on load.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    // serializes log rewrites against appends
    log_lock: Mutex<()>,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            log_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.log_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn encode_entries(entries: &[LogEntry]) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).map_err(StorageError::Encode)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    /// Entries on disk, plus whether a torn tail was dropped.
    fn read_entries(&self) -> Result<(Vec<LogEntry>, bool), StorageError> {
        let path = self.path(LOG_FILE);
        if !path.exists() {
            return Ok((Vec::new(), false));
        }
        let lines: Vec<String> = BufReader::new(File::open(&path)?)
            .lines()
            .collect::<Result<_, _>>()?;
        let last_line = lines.len().saturating_sub(1);

        let mut entries = Vec::with_capacity(lines.len());
        let mut torn = false;
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) if n == last_line => {
                    warn!(path = %path.display(), error = %err, "dropping torn log tail");
                    torn = true;
                }
                Err(err) => {
                    return Err(StorageError::CorruptLog {
                        path,
                        reason: format!("line {}: {err}", n + 1),
                    });
                }
            }
        }
        Ok((entries, torn))
    }

    fn rewrite_log(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let bytes = Self::encode_entries(entries)?;
        self.write_atomic(LOG_FILE, &bytes)
    }
}

impl RaftStorage for FileStorage {
    fn load(&self) -> Result<PersistedState, StorageError> {
        let _guard = self.guard();

        let hs_path = self.path(HARD_STATE_FILE);
        let hard_state: HardState = if hs_path.exists() {
            let bytes = fs::read(&hs_path)?;
            serde_json::from_slice(&bytes).map_err(|source| StorageError::CorruptHardState {
                path: hs_path.clone(),
                source,
            })?
        } else {
            HardState::default()
        };

        let snap_path = self.path(SNAPSHOT_FILE);
        let snapshot = if snap_path.exists() {
            let file = File::open(&snap_path)?;
            let snapshot = Snapshot::read_from(BufReader::new(file)).map_err(|source| {
                StorageError::CorruptSnapshot {
                    path: snap_path.clone(),
                    source,
                }
            })?;
            Some(snapshot)
        } else {
            None
        };

        let (mut entries, torn) = self.read_entries()?;
        if torn {
            // later appends must not land on the partial line
            self.rewrite_log(&entries)?;
        }
        // a crash between recording the purge and rewriting the log leaves stale entries
        if let Some(purged) = hard_state.last_purged {
            entries.retain(|e| e.log_id.index > purged.index);
        }
        for pair in entries.windows(2) {
            let expected = pair[0].log_id.index + 1;
            if pair[1].log_id.index != expected {
                return Err(StorageError::CorruptLog {
                    path: self.path(LOG_FILE),
                    reason: format!("expected index {expected}, found {}", pair[1].log_id.index),
                });
            }
        }

        Ok(PersistedState {
            hard_state,
            snapshot,
            entries,
        })
    }

    fn save_hard_state(&self, hard_state: &HardState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(hard_state).map_err(StorageError::Encode)?;
        self.write_atomic(HARD_STATE_FILE, &bytes)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let _guard = self.guard();
        let bytes = Self::encode_entries(entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(LOG_FILE))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn truncate_from(&self, index: LogIndex) -> Result<(), StorageError> {
        let _guard = self.guard();
        let (mut entries, _) = self.read_entries()?;
        entries.retain(|e| e.log_id.index < index);
        self.rewrite_log(&entries)
    }

    fn purge_through(&self, index: LogIndex) -> Result<(), StorageError> {
        let _guard = self.guard();
        let (mut entries, _) = self.read_entries()?;
        entries.retain(|e| e.log_id.index > index);
        self.rewrite_log(&entries)
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        snapshot.write_to(&mut bytes).map_err(StorageError::Encode)?;
        self.write_atomic(SNAPSHOT_FILE, &bytes)
    }
}
