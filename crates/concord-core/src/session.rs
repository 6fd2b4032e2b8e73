//! Session coordinator - ワーカーセッションの登録と死活監視
//!
//! セッション状態は FSM にのみ存在し、変更は必ず consensus を通します。
//! ヘルスチェックは leader だけが実行します。
//!
//! # ヘルスチェック
//! 1. `last_heartbeat` が `lease_timeout` より古いセッションを探す
//! 2. `session_failure` を適用（FSM の割り当ても消える）
//! 3. durable なタスクを `pending` に戻し、ロックを解放する
//! 4. 既に failed のセッションに残った割り当ても毎回戻す（前回の失敗の再試行）
//!
//! `lease_timeout / 2` を超えて沈黙しているセッションは degraded として報告し、
//! 新しい割り当て先には選びません。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::consensus::ConsensusNode;
use crate::domain::{
    Command, CommandOp, DEFAULT_MAX_CONCURRENT_TASKS, SessionData, SessionError, SessionRef,
    SessionRegistration, SessionStatus, TaskId,
};
use crate::ports::Clock;
use crate::queue::DistributedTaskQueue;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions silent for longer than this are failed.
    pub lease_timeout: Duration,
    pub health_check_interval: Duration,
    pub default_max_concurrent_tasks: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            default_max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

/// Registration request for one worker session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub name: String,
    pub tier: String,
    pub provider: String,
    pub max_concurrent_tasks: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl SessionRequest {
    pub fn new(name: impl Into<String>, tier: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: tier.into(),
            provider: provider.into(),
            max_concurrent_tasks: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Liveness of a session, judged from its last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    /// Silent for more than half the lease, but not past it.
    Degraded,
    Failed,
}

/// Counts of sessions by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub failed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub assigned_tasks: usize,
}

/// Outcome of one health check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub failed_sessions: Vec<String>,
    pub degraded_sessions: Vec<String>,
    pub reassigned_tasks: Vec<TaskId>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    node: ConsensusNode,
    queue: DistributedTaskQueue,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionCoordinator {
    pub fn new(
        node: ConsensusNode,
        queue: DistributedTaskQueue,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            node,
            queue,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register (or re-register) a session through consensus.
    ///
    /// Must be called on the leader; other nodes return `NotLeader`.
    pub async fn register_session(&self, request: SessionRequest) -> Result<SessionData, SessionError> {
        if request.name.trim().is_empty() {
            return Err(SessionError::InvalidRegistration("session name is empty"));
        }
        if request.tier.trim().is_empty() {
            return Err(SessionError::InvalidRegistration("tier is empty"));
        }
        if request.provider.trim().is_empty() {
            return Err(SessionError::InvalidRegistration("provider is empty"));
        }
        let max_concurrent_tasks = match request.max_concurrent_tasks {
            Some(0) => return Err(SessionError::InvalidRegistration("max_concurrent_tasks is 0")),
            Some(max) => max,
            None => self.config.default_max_concurrent_tasks,
        };

        let name = request.name.clone();
        self.submit(CommandOp::SessionRegister(SessionRegistration {
            session_name: request.name,
            tier: request.tier,
            provider: request.provider,
            max_concurrent_tasks,
            metadata: request.metadata,
        }))
        .await?;
        info!(session = %name, max_concurrent_tasks, "session registered");

        self.node
            .fsm()
            .session(&name)
            .ok_or(SessionError::NotFound(name))
    }

    pub async fn record_heartbeat(&self, session_name: &str) -> Result<(), SessionError> {
        self.submit(CommandOp::SessionHeartbeat(SessionRef {
            session_name: session_name.to_string(),
        }))
        .await
    }

    pub fn sessions(&self) -> Vec<SessionData> {
        self.node.fsm().sessions()
    }

    pub fn session(&self, session_name: &str) -> Option<SessionData> {
        self.node.fsm().session(session_name)
    }

    pub fn session_status(&self) -> SessionSummary {
        let now = self.clock.now();
        let state = self.node.fsm().state();
        let mut summary = SessionSummary {
            total: state.sessions.len(),
            assigned_tasks: state.task_assignments.len(),
            ..SessionSummary::default()
        };
        for session in state.sessions.values() {
            match session.status {
                SessionStatus::Idle => summary.idle += 1,
                SessionStatus::Busy => summary.busy += 1,
                SessionStatus::Failed => summary.failed += 1,
            }
            match self.health_of(session, now) {
                SessionHealth::Healthy => summary.healthy += 1,
                SessionHealth::Degraded => summary.degraded += 1,
                SessionHealth::Failed => {}
            }
        }
        summary
    }

    pub fn session_health(&self, session_name: &str) -> Option<SessionHealth> {
        let now = self.clock.now();
        self.session(session_name).map(|s| self.health_of(&s, now))
    }

    /// Sessions heard from within the last half lease.
    pub fn healthy_sessions(&self) -> Vec<SessionData> {
        let now = self.clock.now();
        self.sessions()
            .into_iter()
            .filter(|s| self.health_of(s, now) == SessionHealth::Healthy)
            .collect()
    }

    /// The healthy session with the fewest replicated assignments that still
    /// has room under its `max_concurrent_tasks`. Ties go to the first name.
    pub fn available_session(&self) -> Option<SessionData> {
        let now = self.clock.now();
        let state = self.node.fsm().state();
        state
            .sessions
            .values()
            .filter(|s| self.health_of(s, now) == SessionHealth::Healthy)
            .map(|s| (state.assigned_task_count(&s.session_name), s))
            .filter(|(load, s)| *load < s.max_concurrent_tasks as usize)
            .min_by_key(|(load, _)| *load)
            .map(|(_, s)| s.clone())
    }

    fn health_of(&self, session: &SessionData, now: DateTime<Utc>) -> SessionHealth {
        if session.is_failed() {
            return SessionHealth::Failed;
        }
        let silent = now
            .signed_duration_since(session.last_heartbeat)
            .to_std()
            .unwrap_or_default();
        if silent > self.config.lease_timeout {
            SessionHealth::Failed
        } else if silent > self.config.lease_timeout / 2 {
            SessionHealth::Degraded
        } else {
            SessionHealth::Healthy
        }
    }

    /// Fail sessions whose lease ran out and return their tasks to the queue.
    ///
    /// A no-op on followers. Errors for one session are logged and the pass
    /// moves on; the session is picked up again next tick, including a
    /// failed session whose tasks could not be returned.
    pub async fn perform_health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        if !self.node.is_leader() {
            return report;
        }
        let now = self.clock.now();

        let mut stale = Vec::new();
        let mut already_failed = Vec::new();
        for session in self.node.fsm().sessions() {
            if session.is_failed() {
                already_failed.push(session.session_name);
                continue;
            }
            match self.health_of(&session, now) {
                SessionHealth::Failed => stale.push(session.session_name),
                SessionHealth::Degraded => {
                    debug!(session = %session.session_name, "session heartbeat overdue");
                    report.degraded_sessions.push(session.session_name);
                }
                SessionHealth::Healthy => {}
            }
        }

        for name in already_failed {
            match self.queue.reassign_session_tasks(&name).await {
                Ok(ids) => report.reassigned_tasks.extend(ids),
                Err(err) => warn!(session = %name, error = %err, "failed to reassign session tasks"),
            }
        }

        for name in stale {
            let failure = self
                .submit(CommandOp::SessionFailure(SessionRef {
                    session_name: name.clone(),
                }))
                .await;
            if let Err(err) = failure {
                warn!(session = %name, error = %err, "failed to mark session failed");
                continue;
            }
            warn!(session = %name, "session lease expired");

            match self.queue.reassign_session_tasks(&name).await {
                Ok(ids) => report.reassigned_tasks.extend(ids),
                Err(err) => warn!(session = %name, error = %err, "failed to reassign session tasks"),
            }
            report.failed_sessions.push(name);
        }
        report
    }

    async fn submit(&self, op: CommandOp) -> Result<(), SessionError> {
        let command = Command::new(self.node.id().clone(), self.clock.now(), op);
        self.node.apply(command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::consensus::{
        ConsensusError, InMemoryNetwork, MemStorage, Membership, NodeOptions, RaftConfig,
    };
    use crate::domain::{ApplyError, NodeId, TaskStatus, TaskType};
    use crate::impls::{FaultyTaskStore, InMemoryLockStore, InMemoryTaskStore};
    use crate::lock_manager::DistributedLockManager;
    use crate::ports::{ManualClock, TaskStore, UlidGenerator};
    use crate::queue::QueueConfig;

    /// Claim bookkeeping reaches the FSM in the background.
    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check(), "condition not reached in time");
    }

    struct Fixture {
        coordinator: SessionCoordinator,
        queue: DistributedTaskQueue,
        node: ConsensusNode,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryTaskStore::new())).await
    }

    async fn fixture_with(store: Arc<dyn TaskStore>) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());

        let network = InMemoryNetwork::new();
        let id = NodeId::new("n0");
        let node = ConsensusNode::start(NodeOptions {
            id: id.clone(),
            addr: "mem://n0".into(),
            config: RaftConfig {
                heartbeat_interval: Duration::from_millis(20),
                election_timeout: Duration::from_millis(100),
                rpc_timeout: Duration::from_millis(50),
                ..RaftConfig::default()
            },
            storage: Arc::new(MemStorage::new()),
            transport: network.transport(id.clone()),
            bootstrap: Some(Membership::new([(id.clone(), "mem://n0".to_string())])),
        })
        .await
        .unwrap();
        network.register(id, node.endpoint());
        for _ in 0..300 {
            if node.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(node.is_leader());

        let locks = DistributedLockManager::new(Arc::new(InMemoryLockStore::new()), shared_clock.clone());
        let queue = DistributedTaskQueue::new(
            store,
            locks,
            Arc::new(UlidGenerator::new(clock.clone())),
            shared_clock.clone(),
            QueueConfig::default(),
        )
        .with_consensus(node.clone());
        let coordinator =
            SessionCoordinator::new(node.clone(), queue.clone(), shared_clock, SessionConfig::default());
        Fixture {
            coordinator,
            queue,
            node,
            clock,
        }
    }

    #[tokio::test]
    async fn register_applies_defaults_and_heartbeat_refreshes() {
        let Fixture {
            coordinator,
            node,
            clock,
            ..
        } = fixture().await;

        let session = coordinator
            .register_session(SessionRequest::new("alpha", "standard", "local").metadata("zone", "a"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.max_concurrent_tasks, DEFAULT_MAX_CONCURRENT_TASKS);
        assert_eq!(session.metadata.get("zone").map(String::as_str), Some("a"));

        clock.advance(chrono::Duration::seconds(5));
        coordinator.record_heartbeat("alpha").await.unwrap();
        let refreshed = coordinator.session("alpha").unwrap();
        assert_eq!(refreshed.last_heartbeat, clock.now());
        assert_eq!(refreshed.registered_at, session.registered_at);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_session_is_rejected() {
        let Fixture { coordinator, node, .. } = fixture().await;
        let err = coordinator.record_heartbeat("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Consensus(ConsensusError::Rejected(ApplyError::UnknownSession(name))) if name == "ghost"
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_registration_never_reaches_consensus() {
        let Fixture { coordinator, node, .. } = fixture().await;
        let last_index = node.metrics().last_log_index;

        for request in [
            SessionRequest::new("", "standard", "local"),
            SessionRequest::new("a", " ", "local"),
            SessionRequest::new("a", "standard", ""),
            SessionRequest::new("a", "standard", "local").max_concurrent_tasks(0),
        ] {
            assert!(matches!(
                coordinator.register_session(request).await,
                Err(SessionError::InvalidRegistration(_))
            ));
        }
        assert_eq!(node.metrics().last_log_index, last_index);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn stale_session_fails_and_its_tasks_return_to_pending() {
        let Fixture {
            coordinator,
            queue,
            node,
            clock,
        } = fixture().await;
        coordinator
            .register_session(SessionRequest::new("alpha", "standard", "local"))
            .await
            .unwrap();
        coordinator
            .register_session(SessionRequest::new("beta", "standard", "local"))
            .await
            .unwrap();

        let task = queue.enqueue(TaskType::new("build"), vec![], 0).await.unwrap();
        queue.claim("alpha").await.unwrap();
        eventually(|| node.fsm().assigned_session(&task.id).as_deref() == Some("alpha")).await;

        clock.advance(chrono::Duration::seconds(20));
        coordinator.record_heartbeat("beta").await.unwrap();
        assert_eq!(
            coordinator.perform_health_check().await,
            HealthReport {
                degraded_sessions: vec!["alpha".to_string()],
                ..HealthReport::default()
            }
        );
        assert_eq!(coordinator.session_health("alpha"), Some(SessionHealth::Degraded));
        assert_eq!(queue.get_task_status(&task.id).await.unwrap(), TaskStatus::Assigned);

        clock.advance(chrono::Duration::seconds(15));
        let report = coordinator.perform_health_check().await;
        assert_eq!(report.failed_sessions, vec!["alpha".to_string()]);
        assert_eq!(report.reassigned_tasks, vec![task.id]);

        assert!(coordinator.session("alpha").unwrap().is_failed());
        assert!(!coordinator.session("beta").unwrap().is_failed());
        assert_eq!(node.fsm().assigned_session(&task.id), None);
        assert_eq!(queue.get_task_status(&task.id).await.unwrap(), TaskStatus::Pending);

        let summary = coordinator.session_status();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.idle, 1);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.degraded, 0);
        assert_eq!(summary.assigned_tasks, 0);

        // already failed: not reported twice
        assert_eq!(coordinator.perform_health_check().await, HealthReport::default());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn tasks_left_on_a_failed_session_are_returned_on_the_next_pass() {
        let Fixture {
            coordinator,
            queue,
            node,
            clock,
        } = fixture_with(Arc::new(FaultyTaskStore::new().fail_resets(1))).await;
        coordinator
            .register_session(SessionRequest::new("alpha", "standard", "local"))
            .await
            .unwrap();
        let task = queue.enqueue(TaskType::new("build"), vec![], 0).await.unwrap();
        queue.claim("alpha").await.unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let first = coordinator.perform_health_check().await;
        assert_eq!(first.failed_sessions, vec!["alpha".to_string()]);
        assert!(first.reassigned_tasks.is_empty());
        assert_eq!(queue.get_task_status(&task.id).await.unwrap(), TaskStatus::Assigned);

        let second = coordinator.perform_health_check().await;
        assert!(second.failed_sessions.is_empty());
        assert_eq!(second.reassigned_tasks, vec![task.id]);
        assert_eq!(queue.get_task_status(&task.id).await.unwrap(), TaskStatus::Pending);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn available_session_is_the_least_loaded_healthy_one_with_room() {
        let Fixture {
            coordinator,
            queue,
            node,
            clock,
        } = fixture().await;
        assert!(coordinator.available_session().is_none());

        for (name, max) in [("alpha", 1), ("beta", 2), ("gamma", 2)] {
            coordinator
                .register_session(SessionRequest::new(name, "standard", "local").max_concurrent_tasks(max))
                .await
                .unwrap();
        }
        let first = queue.enqueue(TaskType::new("build"), vec![], 0).await.unwrap();
        let second = queue.enqueue(TaskType::new("build"), vec![], 0).await.unwrap();
        queue.claim("alpha").await.unwrap();
        queue.claim("beta").await.unwrap();
        eventually(|| {
            node.fsm().assigned_session(&first.id).is_some()
                && node.fsm().assigned_session(&second.id).is_some()
        })
        .await;

        // alpha is full, beta holds one
        assert_eq!(coordinator.available_session().unwrap().session_name, "gamma");

        clock.advance(chrono::Duration::seconds(20));
        coordinator.record_heartbeat("alpha").await.unwrap();
        coordinator.record_heartbeat("beta").await.unwrap();
        assert_eq!(coordinator.session_health("gamma"), Some(SessionHealth::Degraded));
        assert_eq!(coordinator.available_session().unwrap().session_name, "beta");

        let healthy: Vec<String> = coordinator
            .healthy_sessions()
            .into_iter()
            .map(|s| s.session_name)
            .collect();
        assert_eq!(healthy, vec!["alpha".to_string(), "beta".to_string()]);

        let summary = coordinator.session_status();
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.degraded, 1);

        clock.advance(chrono::Duration::seconds(11));
        let report = coordinator.perform_health_check().await;
        assert_eq!(report.failed_sessions, vec!["gamma".to_string()]);
        assert!(report.degraded_sessions.is_empty());
        assert_eq!(coordinator.session_health("gamma"), Some(SessionHealth::Failed));
        assert_eq!(coordinator.session_health("ghost"), None);

        node.shutdown().await;
    }
}
