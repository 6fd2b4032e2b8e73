//! Ports - 抽象化レイヤー
//!
//! ロックテーブル・タスクテーブル・時刻・ID 生成を trait で切り離します。
//!
//! # 設計原則
//! - `distributed_tasks` / `distributed_locks` の正本はストア側
//! - 並行する claim の安全性はストアの条件付き更新で担保する（プロセス内ロックに頼らない）
//! - 時刻は必ず Clock 経由で読む

pub mod clock;
pub mod id_generator;
pub mod lock_store;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_store::LockStore;
pub use self::task_store::TaskStore;
