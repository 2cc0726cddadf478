//! Submission, leasing and settlement of tasks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{catalog, PendingChange, TaskContext, TaskKind, TaskOutcome};
use crate::config::QueueConfig;
use crate::model::UserId;
use crate::storage::{CleanReport, Result, TaskStore};

/// What the queue did with a task after executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Rescheduled { attempt_count: u32, run_at: i64 },
    PermanentlyFailed { attempt_count: u32 },
    /// The lease was recovered by another worker before we settled.
    LeaseLost,
}

/// Result of one lease-execute-settle cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
    pub disposition: Disposition,
}

/// Front door to the task store.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    abandon_timeout: Duration,
    wakeup: Notify,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            abandon_timeout: config.abandon_timeout(),
            wakeup: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Persist a new task and wake an idle worker.
    pub async fn submit(&self, user_id: UserId, kind: TaskKind) -> Result<Uuid> {
        self.submit_at(user_id, kind, Utc::now()).await
    }

    /// [`submit`](Self::submit) with an explicit clock.
    pub async fn submit_at(
        &self,
        user_id: UserId,
        kind: TaskKind,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let task = PendingChange::new(user_id, kind, now);
        self.store.insert(task.to_record()?).await?;
        info!(
            task_id = %task.id,
            task_type = task.kind.name(),
            run_at = %task.run_at,
            "{}",
            task.description
        );
        self.wakeup.notify_one();
        Ok(task.id)
    }

    pub(crate) async fn wait_for_submission(&self) {
        self.wakeup.notified().await
    }

    // ========================================================================
    // Administration
    // ========================================================================

    pub async fn get(&self, id: Uuid) -> Result<Option<PendingChange>> {
        self.store
            .get(id)
            .await?
            .as_ref()
            .map(PendingChange::from_record)
            .transpose()
    }

    /// All tasks, including permanently failed ones, ordered by run time.
    pub async fn list(&self) -> Result<Vec<PendingChange>> {
        self.store
            .list()
            .await?
            .iter()
            .map(PendingChange::from_record)
            .collect()
    }

    /// Remove a task regardless of its state.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!(task_id = %id, "Task deleted by operator");
        }
        Ok(deleted)
    }

    /// Drop permanently failed tasks and free abandoned leases.
    pub async fn clean(&self) -> Result<CleanReport> {
        self.clean_at(Utc::now()).await
    }

    pub async fn clean_at(&self, now: DateTime<Utc>) -> Result<CleanReport> {
        let report = CleanReport {
            failed_removed: self.store.delete_failed().await?,
            leases_released: self
                .store
                .release_abandoned(self.abandon_before(now))
                .await?,
        };
        info!(
            failed_removed = report.failed_removed,
            leases_released = report.leases_released,
            "Task queue cleaned"
        );
        Ok(report)
    }

    /// Free leases held past the abandonment timeout. Failed tasks are kept.
    pub async fn recover_leases(&self) -> Result<u64> {
        self.recover_leases_at(Utc::now()).await
    }

    pub async fn recover_leases_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let released = self
            .store
            .release_abandoned(self.abandon_before(now))
            .await?;
        if released > 0 {
            info!(released, "Recovered abandoned leases");
        }
        Ok(released)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn abandon_before(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() - self.abandon_timeout.as_millis() as i64
    }

    /// Lease the next eligible task without executing it.
    pub async fn lease_next_at(&self, now: DateTime<Utc>) -> Result<Option<PendingChange>> {
        let record = self
            .store
            .lease_next(now.timestamp_millis(), self.abandon_before(now))
            .await?;
        record.as_ref().map(PendingChange::from_record).transpose()
    }

    /// Lease, execute and settle one task. `None` when nothing is eligible.
    pub async fn run_next(&self, ctx: &TaskContext) -> Result<Option<TaskRun>> {
        self.run_next_at(ctx, Utc::now()).await
    }

    /// [`run_next`](Self::run_next) with an explicit clock.
    pub async fn run_next_at(
        &self,
        ctx: &TaskContext,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRun>> {
        let now_millis = now.timestamp_millis();
        let Some(record) = self
            .store
            .lease_next(now_millis, self.abandon_before(now))
            .await?
        else {
            return Ok(None);
        };
        let lease = record.obtained_at.unwrap_or(now_millis);

        let task = match PendingChange::from_record(&record) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %record.id, task_type = %record.task_type, error = %e, "Undecodable task");
                let settled = self
                    .store
                    .fail_permanently(record.id, lease, record.attempt_count)
                    .await?;
                return Ok(Some(TaskRun {
                    task_id: record.id,
                    outcome: TaskOutcome::FailedPermanently,
                    disposition: if settled {
                        Disposition::PermanentlyFailed {
                            attempt_count: record.attempt_count,
                        }
                    } else {
                        Disposition::LeaseLost
                    },
                }));
            }
        };

        debug!(task_id = %task.id, attempt = task.attempt_count, "{}", task.description);
        let started = Instant::now();
        let outcome = Self::execute_guarded(&task, ctx).await;
        // Retry delays count from when execution ended, not from the lease.
        let finished_at = now_millis + started.elapsed().as_millis() as i64;
        let disposition = self.settle(&task, lease, outcome, finished_at).await?;

        Ok(Some(TaskRun {
            task_id: task.id,
            outcome,
            disposition,
        }))
    }

    /// Execute, converting a panic into a permanent failure.
    async fn execute_guarded(task: &PendingChange, ctx: &TaskContext) -> TaskOutcome {
        match AssertUnwindSafe(catalog::execute(task, ctx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(task_id = %task.id, task_type = task.kind.name(), "Task panicked");
                TaskOutcome::FailedPermanently
            }
        }
    }

    async fn settle(
        &self,
        task: &PendingChange,
        lease: i64,
        outcome: TaskOutcome,
        finished_at: i64,
    ) -> Result<Disposition> {
        let (settled, disposition) = match outcome {
            TaskOutcome::Success => (
                self.store.complete(task.id, lease).await?,
                Disposition::Completed,
            ),
            TaskOutcome::FailedTemporary => {
                let attempt_count = task.attempt_count + 1;
                if attempt_count > task.kind.max_retry_count() {
                    error!(
                        task_id = %task.id,
                        attempt_count,
                        "Retries exhausted, task permanently failed: {}",
                        task.description
                    );
                    (
                        self.store
                            .fail_permanently(task.id, lease, attempt_count)
                            .await?,
                        Disposition::PermanentlyFailed { attempt_count },
                    )
                } else {
                    let delay = task.kind.retry_interval(attempt_count);
                    let run_at = finished_at + delay.as_millis() as i64;
                    debug!(task_id = %task.id, attempt_count, ?delay, "Task rescheduled");
                    (
                        self.store
                            .reschedule(task.id, lease, attempt_count, run_at)
                            .await?,
                        Disposition::Rescheduled {
                            attempt_count,
                            run_at,
                        },
                    )
                }
            }
            TaskOutcome::FailedPermanently => {
                error!(task_id = %task.id, "Task permanently failed: {}", task.description);
                (
                    self.store
                        .fail_permanently(task.id, lease, task.attempt_count)
                        .await?,
                    Disposition::PermanentlyFailed {
                        attempt_count: task.attempt_count,
                    },
                )
            }
        };

        if settled {
            Ok(disposition)
        } else {
            warn!(task_id = %task.id, "Lease lost before settlement, result discarded");
            Ok(Disposition::LeaseLost)
        }
    }
}
