//! Background workers draining the task queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{TaskContext, TaskQueue};

/// Handle to running workers.
pub struct WorkerHandle {
    cancel: tokio::sync::watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal all workers to stop after their current task.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Task worker exited abnormally");
            }
        }
    }
}

/// Spawn `count` workers polling `queue` every `poll_interval` when idle.
///
/// A worker that finished a task looks for the next one immediately. An idle
/// worker also wakes up as soon as a task is submitted.
pub fn spawn_workers(
    queue: Arc<TaskQueue>,
    ctx: TaskContext,
    count: usize,
    poll_interval: Duration,
) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let tasks = (0..count.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let mut cancel_rx = cancel_rx.clone();

            tokio::spawn(async move {
                info!(worker, poll_interval_ms = poll_interval.as_millis() as u64, "Task worker started");

                loop {
                    if *cancel_rx.borrow() {
                        break;
                    }

                    match queue.run_next(&ctx).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => {}
                        Err(e) => error!(worker, error = %e, "Task queue unavailable"),
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = queue.wait_for_submission() => {}
                        changed = cancel_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }

                info!(worker, "Task worker stopped");
            })
        })
        .collect();

    WorkerHandle {
        cancel: cancel_tx,
        tasks,
    }
}
