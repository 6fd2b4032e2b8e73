//! Impls - ports の実装（開発用・テスト用・デモ用）
//!
//! # 含まれる実装
//! - **InMemoryLockStore**: `distributed_locks` のインメモリ版
//! - **InMemoryTaskStore**: `distributed_tasks` のインメモリ版
//!
//! どちらも 1 つの tokio Mutex の中で「読んで判定して書く」を完結させるので、
//! SQL の単一文と同じ原子性になります。

#[cfg(test)]
pub mod faulty_task_store;
pub mod inmem_lock_store;
pub mod inmem_task_store;

#[cfg(test)]
pub use self::faulty_task_store::FaultyTaskStore;
pub use self::inmem_lock_store::InMemoryLockStore;
pub use self::inmem_task_store::InMemoryTaskStore;
