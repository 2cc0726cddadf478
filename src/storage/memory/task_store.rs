//! In-memory TaskStore.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::{Result, StorageError, TaskRecord, TaskState, TaskStore};

/// Task store backed by a map under a single lock.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
    fail_on_lease: RwLock<bool>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `lease_next` return an error until cleared.
    pub async fn set_fail_on_lease(&self, fail: bool) {
        *self.fail_on_lease.write().await = fail;
    }

    /// Apply `update` if `id` still carries `lease`.
    async fn with_lease<F>(&self, id: Uuid, lease: i64, update: F) -> bool
    where
        F: FnOnce(&mut HashMap<Uuid, TaskRecord>),
    {
        let mut tasks = self.tasks.write().await;
        let holds = tasks
            .get(&id)
            .is_some_and(|task| task.obtained_at == Some(lease));
        if holds {
            update(&mut *tasks);
        }
        holds
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.tasks.write().await.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| (t.run_at, t.id));
        Ok(tasks)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn lease_next(&self, now: i64, abandon_before: i64) -> Result<Option<TaskRecord>> {
        if *self.fail_on_lease.read().await {
            return Err(StorageError::InvalidRecord("lease disabled".into()));
        }

        let mut tasks = self.tasks.write().await;
        let active: Vec<&TaskRecord> = tasks
            .values()
            .filter(|t| t.is_actively_leased(abandon_before))
            .collect();

        let chosen = tasks
            .values()
            .filter(|t| t.is_eligible(now, abandon_before))
            .filter(|t| !active.iter().any(|a| a.id != t.id && a.shares_resource_with(t)))
            .min_by_key(|t| (t.run_at, t.id))
            .map(|t| t.id);

        let Some(id) = chosen else {
            return Ok(None);
        };
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("task", id))?;
        task.obtained_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn complete(&self, id: Uuid, lease: i64) -> Result<bool> {
        Ok(self
            .with_lease(id, lease, |tasks| {
                tasks.remove(&id);
            })
            .await)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        lease: i64,
        attempt_count: u32,
        run_at: i64,
    ) -> Result<bool> {
        Ok(self
            .with_lease(id, lease, |tasks| {
                if let Some(task) = tasks.get_mut(&id) {
                    task.obtained_at = None;
                    task.attempt_count = attempt_count;
                    task.run_at = run_at;
                }
            })
            .await)
    }

    async fn fail_permanently(&self, id: Uuid, lease: i64, attempt_count: u32) -> Result<bool> {
        Ok(self
            .with_lease(id, lease, |tasks| {
                if let Some(task) = tasks.get_mut(&id) {
                    task.obtained_at = None;
                    task.attempt_count = attempt_count;
                    task.state = TaskState::PermanentlyFailed;
                }
            })
            .await)
    }

    async fn delete_failed(&self) -> Result<u64> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| t.state != TaskState::PermanentlyFailed);
        Ok((before - tasks.len()) as u64)
    }

    async fn release_abandoned(&self, abandon_before: i64) -> Result<u64> {
        let mut released = 0;
        for task in self.tasks.write().await.values_mut() {
            if matches!(task.obtained_at, Some(at) if at < abandon_before) {
                task.obtained_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}
