//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Pending-change tasks.
#[derive(Iden)]
pub enum Tasks {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    /// JSON array of resource ids.
    #[iden = "resources"]
    Resources,
    #[iden = "run_at"]
    RunAt,
    #[iden = "obtained_at"]
    ObtainedAt,
    #[iden = "state"]
    State,
    #[iden = "attempt_count"]
    AttemptCount,
    #[iden = "description"]
    Description,
    #[iden = "task_type"]
    TaskType,
    #[iden = "payload"]
    Payload,
}

/// Process documents.
#[derive(Iden)]
pub enum Processes {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "user_id"]
    UserId,
    #[iden = "service_id"]
    ServiceId,
    #[iden = "document"]
    Document,
}

/// Connection documents, indexed by both endpoint processes.
#[derive(Iden)]
pub enum Connections {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "process1"]
    Process1,
    #[iden = "process2"]
    Process2,
    #[iden = "document"]
    Document,
}

/// SQL for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    resources TEXT NOT NULL DEFAULT '[]',
    run_at INTEGER NOT NULL,
    obtained_at INTEGER,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    task_type TEXT NOT NULL,
    payload BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_state_run_at ON tasks(state, run_at);
"#;

/// SQL for creating the processes table.
pub const CREATE_PROCESSES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    service_id TEXT NOT NULL,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processes_user ON processes(user_id);
"#;

/// SQL for creating the connections table.
pub const CREATE_CONNECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    process1 TEXT NOT NULL,
    process2 TEXT NOT NULL,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_process1 ON connections(process1);
CREATE INDEX IF NOT EXISTS idx_connections_process2 ON connections(process2);
"#;
