use std::time::Duration;

use crate::session::SessionCoordinator;

use super::periodic::PeriodicTask;

/// Periodic session health check; the coordinator skips it on followers.
pub struct HealthLoop;

impl HealthLoop {
    pub fn spawn(coordinator: SessionCoordinator, interval: Duration) -> PeriodicTask {
        PeriodicTask::every("session-health", interval, move || {
            let coordinator = coordinator.clone();
            async move {
                coordinator.perform_health_check().await;
            }
        })
    }
}
