use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::service::ApprovalService;

#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub batch_limit: usize,
}

/// Drives escalation timers and drains the storage backlog until `shutdown` flips.
pub fn spawn(
    service: Arc<ApprovalService>,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            event_name = "escalation.worker_started",
            correlation_id = "scheduler",
            poll_interval_secs = settings.poll_interval.as_secs(),
            batch_limit = settings.batch_limit,
            "escalation worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => run_tick(&service, settings.batch_limit).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let pending = service.flush("shutdown").await;
        info!(
            event_name = "escalation.worker_stopped",
            correlation_id = "shutdown",
            pending_writes = pending,
            "escalation worker stopped"
        );
    })
}

pub async fn run_tick(service: &ApprovalService, batch_limit: usize) {
    let correlation_id = format!("sweep-{}", uuid::Uuid::new_v4());
    let report = service.sweep(batch_limit, &correlation_id).await;

    for failure in &report.failures {
        warn!(
            event_name = "escalation.sweep_failure",
            correlation_id = %correlation_id,
            instance_id = %failure.instance_id,
            error = %failure.message,
            "instance left for the next tick"
        );
    }
    let rejected = service.rejected_len().await;
    if rejected > 0 {
        error!(
            event_name = "escalation.rejected_writes",
            correlation_id = %correlation_id,
            rejected_writes = rejected,
            "committed changes refused by storage"
        );
    }
    let pending = service.backlog_len().await;
    if pending > 0 {
        warn!(
            event_name = "escalation.backlog",
            correlation_id = %correlation_id,
            pending_writes = pending,
            "committed changes still waiting for storage"
        );
    }
    debug!(
        event_name = "escalation.tick",
        correlation_id = %correlation_id,
        examined = report.examined,
        escalated = report.escalated,
        "escalation tick finished"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use signoff_core::domain::workflow::StepAction;
    use tokio::sync::watch;

    use super::{run_tick, spawn, WorkerSettings};
    use crate::test_support::{harness, purchase_request};

    #[tokio::test]
    async fn tick_persists_timer_escalations() {
        let harness = harness().await;
        let routed = harness.service.route(purchase_request(3000), "corr-1").await.expect("route");

        run_tick(&harness.service, 50).await;
        let untouched = harness
            .store
            .workflows()
            .find_instance(&routed.value.instance.id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(untouched.state_version, routed.value.instance.state_version);

        harness.clock.advance(ChronoDuration::hours(30));
        run_tick(&harness.service, 50).await;

        let stored = harness
            .store
            .workflows()
            .find_instance(&routed.value.instance.id)
            .await
            .expect("find")
            .expect("stored");
        assert!(stored.step_history.iter().any(|entry| entry.action == StepAction::Escalated));
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown_signal() {
        let harness = harness().await;
        let (sender, receiver) = watch::channel(false);
        let handle = spawn(
            harness.service.clone(),
            WorkerSettings { poll_interval: Duration::from_millis(10), batch_limit: 10 },
            receiver,
        );

        sender.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .expect("worker task");
    }
}
