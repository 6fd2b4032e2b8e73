//! App - アプリケーション層
//!
//! consensus / queue / session を組み合わせて 1 ノードを動かします。
//!
//! # 主要コンポーネント
//! - **ClusterNodeBuilder**: ワイヤリングと起動時検証
//! - **PeriodicTask**: 個別の stop シグナルを持つバックグラウンドタスク
//! - **ReaperLoop**: 期限切れ claim / lock の回収（leader のみ）
//! - **HealthLoop**: セッションのヘルスチェック（leader のみ）
//! - **WorkerGroup**: claim → handler 実行 → complete / fail
//! - **ClusterStatus**: ノード状態のまとめ

pub mod builder;
pub mod handler;
pub mod health_loop;
pub mod periodic;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, ClusterNode, ClusterNodeBuilder};
pub use self::handler::{
    Handler, HandlerError, HandlerRegistry, RegistryError, TaskHandler, TypedHandler, TypedTask,
};
pub use self::health_loop::HealthLoop;
pub use self::periodic::PeriodicTask;
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::status::ClusterStatus;
pub use self::worker_loop::WorkerGroup;
