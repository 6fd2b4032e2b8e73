//! concord-core
//!
//! Replicated coordination for a fleet of worker sessions.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, command, session, task, lock, errors）
//! - **fsm**: replicated state machine（純粋な apply / snapshot）
//! - **consensus**: Raft ノード、ログ、永続化、トランスポート
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, TaskStore, LockStore）
//! - **impls**: ports の in-memory 実装
//! - **lock_manager**: リースベースの分散ロック
//! - **queue**: 分散タスクキュー（lock → 条件付き更新の 2 段階 claim）
//! - **session**: セッション登録とヘルスチェック
//! - **discovery**: ノード発見とメンバーシップ通知
//! - **app**: ワイヤリング、バックグラウンドループ、ワーカー
//! - **config**: TOML + 環境変数の設定

pub mod app;
pub mod config;
pub mod consensus;
pub mod discovery;
pub mod domain;
pub mod fsm;
pub mod impls;
pub mod lock_manager;
pub mod ports;
pub mod queue;
pub mod session;

pub use app::{ClusterNode, ClusterNodeBuilder};
pub use config::ConcordConfig;
pub use consensus::ConsensusNode;
pub use lock_manager::DistributedLockManager;
pub use queue::DistributedTaskQueue;
pub use session::SessionCoordinator;
