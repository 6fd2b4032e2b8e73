//! PeriodicTask - 停止可能なバックグラウンドタスク
//!
//! 各タスクは自分専用の stop シグナルを持ち、`stop().await` で
//! 実行中の tick が終わるまで待ってから戻ります。

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicTask {
    /// Run `tick` every `interval`, first after one full interval.
    /// A tick in progress is never interrupted by `stop`.
    pub fn every<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |mut stop| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => tick().await,
                }
            }
        })
    }

    /// Spawn a long-running body that watches its own stop signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(body(stop_rx));
        debug!(task = %name, "background task started");
        Self {
            name,
            stop_tx,
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal stop and wait for the task to exit.
    pub async fn stop(self) {
        // receiver is gone when the body already returned
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.join.await {
            warn!(task = %self.name, error = %err, "background task ended abnormally");
        } else {
            debug!(task = %self.name, "background task stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let task = PeriodicTask::every("count", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn stop_returns_for_a_body_that_already_exited() {
        let task = PeriodicTask::spawn("once", |_stop| async {});
        tokio::task::yield_now().await;
        task.stop().await;
    }

    #[tokio::test]
    async fn each_task_has_its_own_signal() {
        let a = PeriodicTask::spawn("a", |mut stop| async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        });
        let b = PeriodicTask::spawn("b", |mut stop| async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        });
        a.stop().await;
        tokio::task::yield_now().await;
        assert!(!b.is_finished());
        assert_eq!(b.name(), "b");
        b.stop().await;
    }
}
