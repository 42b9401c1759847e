//! # Sweeper Background Service
//!
//! Periodic maintenance pass over every process:
//!
//! 1. mark open tasks past their due date as Overdue
//! 2. time out Active nodes past their deadline
//! 3. retry dead-lettered history records
//! 4. redeliver events that failed to reach a subscriber
//!
//! Every step is idempotent, so the loop is safe under at-least-once
//! scheduling and a slow pass never needs to be cancelled.
//!
//! ```rust,no_run
//! use procflow_core::orchestration::{ProcessManager, Sweeper};
//!
//! # async fn example() {
//! let manager = ProcessManager::in_memory();
//! let sweeper = Sweeper::spawn(manager.clone());
//! // ...
//! sweeper.shutdown().await;
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::process_manager::ProcessManager;

/// Counts from one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub tasks_marked_overdue: usize,
    pub nodes_timed_out: usize,
    pub history_recovered: usize,
    pub events_redelivered: usize,
    pub locks_released: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Handle to a running sweep loop
#[derive(Debug)]
pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start the loop on `scheduler.sweep_interval_seconds`
    pub fn spawn(manager: ProcessManager) -> Self {
        let every = manager.config().scheduler.sweep_interval();
        Self::spawn_with_interval(manager, every)
    }

    pub fn spawn_with_interval(manager: ProcessManager, every: Duration) -> Self {
        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = every.as_millis() as u64, "Starting sweeper");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let started = Instant::now();
                        let report = Self::run_once(&manager, Utc::now()).await;
                        if report.is_empty() {
                            debug!("Sweep found nothing to do");
                        } else {
                            info!(
                                tasks_marked_overdue = report.tasks_marked_overdue,
                                nodes_timed_out = report.nodes_timed_out,
                                history_recovered = report.history_recovered,
                                events_redelivered = report.events_redelivered,
                                locks_released = report.locks_released,
                                duration_ms = started.elapsed().as_millis() as u64,
                                "Sweep completed"
                            );
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        });

        Self { shutdown, handle }
    }

    /// One idempotent pass as of `now`. Failures of a step are logged and the
    /// remaining steps still run.
    pub async fn run_once(manager: &ProcessManager, now: DateTime<Utc>) -> SweepReport {
        let scheduler = manager.task_scheduler();
        let mut report = SweepReport::default();

        match scheduler.sweep_overdue(now).await {
            Ok(count) => report.tasks_marked_overdue = count,
            Err(e) => error!(error = %e, "Overdue sweep failed"),
        }
        match scheduler.sweep_timeouts(now).await {
            Ok(count) => report.nodes_timed_out = count,
            Err(e) => error!(error = %e, "Timeout sweep failed"),
        }
        report.history_recovered = manager.history().retry_dead_letters().await;
        report.events_redelivered = manager.events().redeliver_pending().await;
        report.locks_released = manager.release_idle_locks();

        report
    }

    /// Signal the loop to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalMode, NodeTemplate, ProcessTemplate, RuleTemplate, TimeoutAction};
    use crate::orchestration::NewProcess;
    use crate::state_machine::{NodeStatus, ProcessStatus, TaskStatus};
    use chrono::Duration as ChronoDuration;

    fn review_template(review: NodeTemplate) -> ProcessTemplate {
        ProcessTemplate::new("sweep", "Sweep")
            .with_node(NodeTemplate::start("start"))
            .with_node(review)
            .with_node(NodeTemplate::end("end"))
            .with_rule(RuleTemplate::always("start", "review", 0))
            .with_rule(RuleTemplate::always("review", "end", 0))
    }

    async fn started(manager: &ProcessManager, template: &ProcessTemplate) -> uuid::Uuid {
        let process = manager
            .create(template, NewProcess::named("sweep me"), "alice")
            .await
            .unwrap();
        manager.start(process.process_id, "alice").await.unwrap();
        process.process_id
    }

    #[tokio::test]
    async fn test_run_once_marks_overdue_once() {
        let manager = ProcessManager::in_memory();
        let template = review_template(
            NodeTemplate::task("review", "Review", ["bob"], ApprovalMode::Any).with_due_in(60),
        );
        let process_id = started(&manager, &template).await;
        let later = Utc::now() + ChronoDuration::hours(1);

        let first = Sweeper::run_once(&manager, later).await;
        assert_eq!(first.tasks_marked_overdue, 1);

        let second = Sweeper::run_once(&manager, later).await;
        assert_eq!(second.tasks_marked_overdue, 0);

        let tasks = manager.task_scheduler().process_tasks(process_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Overdue);
        assert!(tasks[0].overdue_at.is_some());
    }

    #[tokio::test]
    async fn test_run_once_times_out_active_node() {
        let manager = ProcessManager::in_memory();
        let template = review_template(
            NodeTemplate::task("review", "Review", ["bob"], ApprovalMode::Any)
                .with_timeout(30, TimeoutAction::TerminateProcess),
        );
        let process_id = started(&manager, &template).await;

        let now = Sweeper::run_once(&manager, Utc::now()).await;
        assert_eq!(now.nodes_timed_out, 0);

        let report = Sweeper::run_once(&manager, Utc::now() + ChronoDuration::minutes(5)).await;
        assert_eq!(report.nodes_timed_out, 1);

        let process = manager.get(process_id).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Terminated);
        let nodes = manager.node_engine().process_nodes(process_id).await.unwrap();
        let review = nodes.iter().find(|n| n.template_key == "review").unwrap();
        assert_eq!(review.status, NodeStatus::Timeout);
    }

    #[tokio::test]
    async fn test_suspended_process_is_not_timed_out() {
        let manager = ProcessManager::in_memory();
        let template = review_template(
            NodeTemplate::task("review", "Review", ["bob"], ApprovalMode::Any)
                .with_timeout(30, TimeoutAction::TerminateProcess),
        );
        let process_id = started(&manager, &template).await;
        manager.suspend(process_id, Some("audit".into()), "alice").await.unwrap();

        let report = Sweeper::run_once(&manager, Utc::now() + ChronoDuration::minutes(5)).await;
        assert_eq!(report.nodes_timed_out, 0);
        assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Suspended);
    }

    #[tokio::test]
    async fn test_empty_sweep_reports_nothing() {
        let manager = ProcessManager::in_memory();
        let report = Sweeper::run_once(&manager, Utc::now()).await;
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let manager = ProcessManager::in_memory();
        let sweeper = Sweeper::spawn_with_interval(manager, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        sweeper.shutdown().await;
    }
}
