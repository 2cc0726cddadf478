//! Pending-change task queue.
//!
//! Tasks are persisted through a [`TaskStore`](crate::storage::TaskStore),
//! leased one at a time per worker, executed, and then completed, rescheduled
//! with backoff, or marked permanently failed. The store's lease is atomic
//! and respects resource contention, so any number of workers may run.

mod catalog;
mod context;
mod manager;
mod task;
mod worker;

pub use context::TaskContext;
pub use manager::{Disposition, TaskQueue, TaskRun};
pub use task::{TaskKind, DEFAULT_MAX_RETRY_COUNT};
pub use worker::{spawn_workers, WorkerHandle};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::UserId;
use crate::storage::{StorageError, TaskRecord, TaskState};

/// What one execution of a task amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    FailedTemporary,
    FailedPermanently,
}

/// A decoded task as seen by the queue and operators.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: Uuid,
    pub user_id: UserId,
    pub resources: Vec<String>,
    pub description: String,
    pub run_at: DateTime<Utc>,
    pub obtained_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub state: TaskState,
    pub kind: TaskKind,
}

impl PendingChange {
    /// A new, unleased task that becomes eligible `kind.delay()` after `now`.
    pub fn new(user_id: UserId, kind: TaskKind, now: DateTime<Utc>) -> Self {
        let delay = chrono::Duration::from_std(kind.delay()).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            user_id,
            resources: kind.resources(user_id),
            description: kind.description(),
            run_at: now + delay,
            obtained_at: None,
            attempt_count: 0,
            state: TaskState::Pending,
            kind,
        }
    }

    pub fn to_record(&self) -> Result<TaskRecord, StorageError> {
        Ok(TaskRecord {
            id: self.id,
            user_id: self.user_id,
            resources: self.resources.clone(),
            run_at: self.run_at.timestamp_millis(),
            obtained_at: self.obtained_at.map(|t| t.timestamp_millis()),
            state: self.state,
            attempt_count: self.attempt_count,
            description: self.description.clone(),
            task_type: self.kind.name().to_string(),
            payload: serde_json::to_vec(&self.kind)?,
        })
    }

    pub fn from_record(record: &TaskRecord) -> Result<Self, StorageError> {
        let kind: TaskKind = serde_json::from_slice(&record.payload)?;
        if kind.name() != record.task_type {
            return Err(StorageError::InvalidRecord(format!(
                "task {} has type {} but payload of {}",
                record.id,
                record.task_type,
                kind.name()
            )));
        }

        Ok(Self {
            id: record.id,
            user_id: record.user_id,
            resources: record.resources.clone(),
            description: record.description.clone(),
            run_at: millis_to_time(record.run_at)?,
            obtained_at: record.obtained_at.map(millis_to_time).transpose()?,
            attempt_count: record.attempt_count,
            state: record.state,
            kind,
        })
    }
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidRecord(format!("timestamp {millis} out of range")))
}
