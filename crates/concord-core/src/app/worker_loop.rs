use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{DistributedTask, QueueError};
use crate::queue::DistributedTaskQueue;

use super::handler::HandlerRegistry;

/// One worker per session name.
/// - `request_shutdown()` stops claiming; a running handler finishes first
/// - `shutdown_and_join()` waits for every worker
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn a worker for each session. Idle workers poll every `poll_interval`.
    pub fn spawn(
        sessions: Vec<String>,
        queue: DistributedTaskQueue,
        registry: Arc<HandlerRegistry>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = sessions
            .into_iter()
            .map(|session| {
                let worker = Worker {
                    session,
                    queue: queue.clone(),
                    registry: Arc::clone(&registry),
                    poll_interval,
                };
                let rx = shutdown_rx.clone();
                tokio::spawn(worker.run(rx))
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }
    }
}

struct Worker {
    session: String,
    queue: DistributedTaskQueue,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(session = %self.session, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                claimed = self.queue.claim(&self.session) => claimed,
            };

            match claimed {
                Ok(task) => self.execute(task).await,
                Err(QueueError::NoClaimableTasks) => self.idle(&mut shutdown).await,
                Err(err) => {
                    warn!(session = %self.session, error = %err, "claim failed");
                    self.idle(&mut shutdown).await;
                }
            }
        }
        info!(session = %self.session, "worker stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn execute(&self, task: DistributedTask) {
        let outcome = match self.registry.get(&task.task_type) {
            Some(handler) => handler.handle(&task).await.map_err(|e| e.to_string()),
            None => Err(format!("no handler registered for task type '{}'", task.task_type)),
        };

        let reported = match outcome {
            Ok(result) => self
                .queue
                .complete(&task.id, &self.session, result)
                .await
                .map(|_| ()),
            Err(reason) => {
                debug!(task_id = %task.id, session = %self.session, %reason, "handler failed");
                self.queue
                    .fail(&task.id, &self.session, &reason)
                    .await
                    .map(|_| ())
            }
        };
        // the claim lease expires and the reaper requeues the task
        if let Err(err) = reported {
            warn!(task_id = %task.id, session = %self.session, error = %err, "failed to report task outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::app::handler::{Handler, HandlerError, TypedTask};
    use crate::domain::{TaskStatus, TaskType};
    use crate::impls::{InMemoryLockStore, InMemoryTaskStore};
    use crate::lock_manager::DistributedLockManager;
    use crate::ports::{Clock, SystemClock, UlidGenerator};
    use crate::queue::QueueConfig;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl TypedTask for Echo {
        const TYPE: &'static str = "test.echo.v1";
    }

    struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, task: Echo) -> Result<Option<Vec<u8>>, HandlerError> {
            if task.text == "boom" {
                return Err(HandlerError::new("boom"));
            }
            Ok(Some(task.text.into_bytes()))
        }
    }

    fn queue() -> DistributedTaskQueue {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        DistributedTaskQueue::new(
            Arc::new(InMemoryTaskStore::new()),
            DistributedLockManager::new(Arc::new(InMemoryLockStore::new()), clock.clone()),
            Arc::new(UlidGenerator::new(SystemClock)),
            clock,
            QueueConfig {
                max_retries: 1,
                ..QueueConfig::default()
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_drain_the_queue() {
        let queue = queue();
        let mut registry = HandlerRegistry::new();
        registry.register_typed::<Echo, _>(EchoHandler).unwrap();

        let mut ids = Vec::new();
        for i in 0..10 {
            let task = queue
                .enqueue_with(Echo { text: format!("hello-{i}") }.to_new_task().unwrap())
                .await
                .unwrap();
            ids.push(task.id);
        }
        let boom = queue
            .enqueue_with(Echo { text: "boom".into() }.to_new_task().unwrap())
            .await
            .unwrap();
        let orphan = queue
            .enqueue(TaskType::new("unknown.v1"), vec![], 0)
            .await
            .unwrap();

        let group = WorkerGroup::spawn(
            vec!["w1".into(), "w2".into(), "w3".into()],
            queue.clone(),
            Arc::new(registry),
            Duration::from_millis(10),
        );
        assert_eq!(group.len(), 3);

        for _ in 0..300 {
            if queue.task_counts().await.unwrap().is_drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown_and_join().await;

        let counts = queue.task_counts().await.unwrap();
        assert_eq!(counts.completed, 10);
        assert_eq!(counts.failed, 2);
        for id in ids {
            let task = queue.get_task(&id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert!(task.result.is_some());
        }

        let boom = queue.get_task(&boom.id).await.unwrap().unwrap();
        assert_eq!(boom.status, TaskStatus::Failed);
        assert_eq!(boom.retry_count, 1);
        assert_eq!(boom.last_error.as_deref(), Some("boom"));

        let orphan = queue.get_task(&orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, TaskStatus::Failed);
        assert!(orphan.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn idle_workers_stop_promptly() {
        let group = WorkerGroup::spawn(
            vec!["w1".into()],
            queue(),
            Arc::new(HandlerRegistry::new()),
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }
}
