use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{ClaimedTask, QueueError, TaskQueue};
use crate::tasks::{HandlerReport, TaskDispatcher};

/// Floor for the heartbeat period when the queue lease is very short.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub idle_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(500),
        }
    }
}

/// Execute one claimed task while renewing its lease every third of the
/// lease period, so a slow actuation is never handed to a second worker.
pub(crate) async fn execute_leased(
    queue: &dyn TaskQueue,
    dispatcher: &TaskDispatcher,
    task: &ClaimedTask,
) -> HandlerReport {
    let every = (queue.lease() / 3).max(MIN_HEARTBEAT);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let run = dispatcher.execute(task);
    tokio::pin!(run);

    loop {
        tokio::select! {
            report = &mut run => return report,
            _ = heartbeat.tick() => match queue.extend_lease(task.id).await {
                Ok(true) => debug!(task_id = %task.id, "lease extended"),
                Ok(false) => warn!(task_id = %task.id, "lease lost while task was running"),
                Err(err) => warn!(task_id = %task.id, error = %err, "heartbeat failed"),
            },
        }
    }
}

/// Worker group handle.
/// - `request_shutdown` stops every loop from claiming new tasks
/// - `shutdown_and_join` also waits for in-flight tasks to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(
        n: usize,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<TaskDispatcher>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = Arc::clone(&queue);
            let dispatcher = Arc::clone(&dispatcher);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, dispatcher, config, &mut rx).await;
            }));
        }
        info!(workers = n, "delivery workers started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<TaskDispatcher>,
    config: WorkerConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // one at a time: a claimed task is always either running or heartbeating
        let claimed = match queue.claim(1).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(worker_id, error = %err, "claiming tasks failed");
                Vec::new()
            }
        };

        let Some(task) = claimed.into_iter().next() else {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(config.idle_wait) => {}
            }
            continue;
        };

        execute_leased(queue.as_ref(), &dispatcher, &task).await;
        if let Err(err) = queue.complete(task.id).await {
            error!(worker_id, task_id = %task.id, error = %err, "completing task failed");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub executed: usize,
    pub stored: usize,
    pub removed: usize,
    pub ineligible: usize,
    pub failed: usize,
}

impl DrainSummary {
    fn record(&mut self, report: &HandlerReport) {
        self.executed += 1;
        match report {
            HandlerReport::Stored { .. } => self.stored += 1,
            HandlerReport::Removed { .. } => self.removed += 1,
            HandlerReport::Ineligible { .. } => self.ineligible += 1,
            HandlerReport::ActuationFailed { .. }
            | HandlerReport::StoreFailed { .. }
            | HandlerReport::Rejected { .. } => self.failed += 1,
        }
    }
}

/// Run every currently claimable task to completion on the calling task.
pub async fn drain_once(
    queue: &dyn TaskQueue,
    dispatcher: &TaskDispatcher,
) -> Result<DrainSummary, QueueError> {
    let mut summary = DrainSummary::default();
    while let Some(task) = queue.claim(1).await?.into_iter().next() {
        let report = execute_leased(queue, dispatcher, &task).await;
        summary.record(&report);
        queue.complete(task.id).await?;
    }
    Ok(summary)
}
