//! Persistence backends.
//!
//! The orchestrator persists three kinds of documents: pending-change tasks,
//! processes and connections. The service catalog is read-only at runtime.
//! Each concern sits behind its own trait so tests can mix backends.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::model::{Connection, ConnectionId, Process, ProcessId, ProcessState, Service, UserId};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{
    MemoryConnectionStore, MemoryProcessStore, MemoryServiceRegistry, MemoryTaskStore,
};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnectionStore, SqliteProcessStore, SqliteTaskStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Service catalog error: {0}")]
    Catalog(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

// ============================================================================
// Task records
// ============================================================================

/// Terminal/non-terminal state of a persisted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    PermanentlyFailed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskState::Pending),
            "PERMANENTLY_FAILED" => Some(TaskState::PermanentlyFailed),
            _ => None,
        }
    }
}

/// Persisted form of a pending change.
///
/// Timestamps are epoch milliseconds. `obtained_at` doubles as the lease
/// token: every write that ends a lease is conditional on it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub resources: Vec<String>,
    pub run_at: i64,
    pub obtained_at: Option<i64>,
    pub state: TaskState,
    pub attempt_count: u32,
    pub description: String,
    pub task_type: String,
    pub payload: Vec<u8>,
}

impl TaskRecord {
    /// Whether this record may be leased at `now` given the abandonment cutoff.
    pub fn is_eligible(&self, now: i64, abandon_before: i64) -> bool {
        self.state == TaskState::Pending
            && self.run_at <= now
            && !matches!(self.obtained_at, Some(at) if at >= abandon_before)
    }

    /// Whether this record holds a live, non-abandoned lease.
    pub fn is_actively_leased(&self, abandon_before: i64) -> bool {
        self.state == TaskState::Pending && self.obtained_at.is_some_and(|at| at >= abandon_before)
    }

    pub fn shares_resource_with(&self, other: &TaskRecord) -> bool {
        self.resources.iter().any(|r| other.resources.contains(r))
    }
}

/// Counts returned by a queue cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub failed_removed: u64,
    pub leases_released: u64,
}

// ============================================================================
// Store traits
// ============================================================================

/// Durable storage for pending-change tasks.
///
/// `lease_next` is the only way a task is claimed. Implementations must make
/// the select-and-mark step atomic so two callers never receive the same task,
/// and must skip tasks sharing a resource with any actively leased task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, record: TaskRecord) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>>;

    /// All tasks ordered by `run_at`.
    async fn list(&self) -> Result<Vec<TaskRecord>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Claim the earliest eligible task, stamping `obtained_at = now`.
    ///
    /// A lease older than `abandon_before` counts as abandoned.
    async fn lease_next(&self, now: i64, abandon_before: i64) -> Result<Option<TaskRecord>>;

    /// Remove a successfully executed task. False when the lease was lost.
    async fn complete(&self, id: Uuid, lease: i64) -> Result<bool>;

    /// Release the lease and make the task eligible again at `run_at`.
    async fn reschedule(&self, id: Uuid, lease: i64, attempt_count: u32, run_at: i64)
        -> Result<bool>;

    /// Mark the task permanently failed; it is never leased again.
    async fn fail_permanently(&self, id: Uuid, lease: i64, attempt_count: u32) -> Result<bool>;

    /// Delete every permanently failed task.
    async fn delete_failed(&self) -> Result<u64>;

    /// Clear leases stamped before `abandon_before`.
    async fn release_abandoned(&self, abandon_before: i64) -> Result<u64>;
}

/// Process documents.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Fetch a process, `NotFound` when absent.
    async fn get_process(&self, id: ProcessId) -> Result<Process>;

    /// Insert or replace a process document.
    async fn put_process(&self, process: &Process) -> Result<()>;

    async fn delete_process(&self, id: ProcessId) -> Result<bool>;

    async fn list_processes(&self) -> Result<Vec<Process>>;

    async fn list_processes_for_user(&self, user_id: UserId) -> Result<Vec<Process>>;

    /// Record the state a process reported.
    async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<()> {
        let mut process = self.get_process(id).await?;
        process.state = state;
        self.put_process(&process).await
    }
}

/// Connection documents.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Fetch a connection, `NotFound` when absent.
    async fn get_connection(&self, id: ConnectionId) -> Result<Connection>;

    async fn put_connection(&self, connection: &Connection) -> Result<()>;

    async fn delete_connection(&self, id: ConnectionId) -> Result<bool>;

    /// Connections having `process_id` at either endpoint.
    async fn connections_for_process(&self, process_id: ProcessId) -> Result<Vec<Connection>>;
}

/// Read-only service catalog.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Fetch a service, `NotFound` when absent.
    async fn get_service(&self, id: &str) -> Result<Service>;

    async fn list_services(&self) -> Result<Vec<Service>>;
}

// ============================================================================
// Initialization
// ============================================================================

/// The mutable stores, shared across subsystems.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub processes: Arc<dyn ProcessStore>,
    pub connections: Arc<dyn ConnectionStore>,
}

impl Stores {
    /// Fresh in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::new()),
            processes: Arc::new(MemoryProcessStore::new()),
            connections: Arc::new(MemoryConnectionStore::new()),
        }
    }
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Stores, Box<dyn std::error::Error>> {
    info!("Storage: {} at {}", config.storage_type, config.path);

    match config.storage_type.as_str() {
        "memory" => Ok(Stores::in_memory()),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
            tasks.init().await?;

            let processes = Arc::new(SqliteProcessStore::new(pool.clone()));
            processes.init().await?;

            let connections = Arc::new(SqliteConnectionStore::new(pool));
            connections.init().await?;

            Ok(Stores {
                tasks,
                processes,
                connections,
            })
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
        other => {
            error!("Unknown storage type: {}", other);
            Err(format!("Unknown storage type: {}", other).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(resources: &[&str], run_at: i64, obtained_at: Option<i64>) -> TaskRecord {
        TaskRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
            run_at,
            obtained_at,
            state: TaskState::Pending,
            attempt_count: 0,
            description: "test".into(),
            task_type: "Test".into(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_eligibility() {
        assert!(record(&[], 100, None).is_eligible(100, 0));
        assert!(!record(&[], 101, None).is_eligible(100, 0));
        assert!(!record(&[], 50, Some(90)).is_eligible(100, 80));
        assert!(record(&[], 50, Some(70)).is_eligible(100, 80));

        let mut failed = record(&[], 0, None);
        failed.state = TaskState::PermanentlyFailed;
        assert!(!failed.is_eligible(100, 0));
    }

    #[test]
    fn test_resource_overlap() {
        let a = record(&["p1", "u1"], 0, None);
        let b = record(&["c1", "p1"], 0, None);
        let c = record(&["c2"], 0, None);
        assert!(a.shares_resource_with(&b));
        assert!(!a.shares_resource_with(&c));
    }

    #[test]
    fn test_task_state_parse() {
        for state in [TaskState::Pending, TaskState::PermanentlyFailed] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("DONE"), None);
    }
}
