//! SQLite TaskStore implementation.

use async_trait::async_trait;
use sea_query::{Cond, Expr, Order, Query, SqliteQueryBuilder};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use super::parse_uuid;
use crate::storage::schema::{Tasks, CREATE_TASKS_TABLE};
use crate::storage::{Result, StorageError, TaskRecord, TaskState, TaskStore};

const TASK_COLUMNS: [Tasks; 10] = [
    Tasks::Id,
    Tasks::UserId,
    Tasks::Resources,
    Tasks::RunAt,
    Tasks::ObtainedAt,
    Tasks::State,
    Tasks::AttemptCount,
    Tasks::Description,
    Tasks::TaskType,
    Tasks::Payload,
];

/// SQLite implementation of TaskStore.
///
/// Leasing runs inside `BEGIN IMMEDIATE`, so the select-and-mark step holds
/// the database write lock and is atomic across connections and processes.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SQLite task store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_TASKS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn from_row(row: &SqliteRow) -> Result<TaskRecord> {
        let id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let resources: String = row.get("resources");
        let state: String = row.get("state");
        let attempt_count: i64 = row.get("attempt_count");

        Ok(TaskRecord {
            id: parse_uuid(&id)?,
            user_id: parse_uuid(&user_id)?,
            resources: serde_json::from_str(&resources)?,
            run_at: row.get("run_at"),
            obtained_at: row.get("obtained_at"),
            state: TaskState::parse(&state)
                .ok_or_else(|| StorageError::InvalidRecord(format!("task state {state}")))?,
            attempt_count: u32::try_from(attempt_count)
                .map_err(|_| StorageError::InvalidRecord(format!("attempt count {attempt_count}")))?,
            description: row.get("description"),
            task_type: row.get("task_type"),
            payload: row.get("payload"),
        })
    }

    /// Pick and stamp the next task on an already-locked connection.
    async fn lease_locked(
        conn: &mut PoolConnection<Sqlite>,
        now: i64,
        abandon_before: i64,
    ) -> Result<Option<TaskRecord>> {
        let active = Query::select()
            .column(Tasks::Resources)
            .from(Tasks::Table)
            .and_where(Expr::col(Tasks::State).eq(TaskState::Pending.as_str()))
            .and_where(Expr::col(Tasks::ObtainedAt).gte(abandon_before))
            .to_string(SqliteQueryBuilder);

        let mut busy: Vec<String> = Vec::new();
        for row in sqlx::query(&active).fetch_all(&mut **conn).await? {
            let resources: String = row.get("resources");
            busy.extend(serde_json::from_str::<Vec<String>>(&resources)?);
        }

        let candidates = Query::select()
            .columns(TASK_COLUMNS)
            .from(Tasks::Table)
            .and_where(Expr::col(Tasks::State).eq(TaskState::Pending.as_str()))
            .and_where(Expr::col(Tasks::RunAt).lte(now))
            .cond_where(
                Cond::any()
                    .add(Expr::col(Tasks::ObtainedAt).is_null())
                    .add(Expr::col(Tasks::ObtainedAt).lt(abandon_before)),
            )
            .order_by(Tasks::RunAt, Order::Asc)
            .order_by(Tasks::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&candidates).fetch_all(&mut **conn).await?;
        let mut chosen = None;
        for row in &rows {
            let task = Self::from_row(row)?;
            if !task.resources.iter().any(|r| busy.contains(r)) {
                chosen = Some(task);
                break;
            }
        }

        let Some(mut task) = chosen else {
            return Ok(None);
        };

        let stamp = Query::update()
            .table(Tasks::Table)
            .values([(Tasks::ObtainedAt, now.into())])
            .and_where(Expr::col(Tasks::Id).eq(task.id.to_string()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&stamp).execute(&mut **conn).await?;

        task.obtained_at = Some(now);
        Ok(Some(task))
    }

    /// Build an update that only applies while the caller still holds the lease.
    fn leased_update(id: Uuid, lease: i64, values: Vec<(Tasks, sea_query::SimpleExpr)>) -> String {
        Query::update()
            .table(Tasks::Table)
            .values(values)
            .and_where(Expr::col(Tasks::Id).eq(id.to_string()))
            .and_where(Expr::col(Tasks::ObtainedAt).eq(lease))
            .to_string(SqliteQueryBuilder)
    }

    /// Run a statement, returning whether a row matched.
    async fn execute_matched(&self, query: String) -> Result<bool> {
        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<()> {
        let resources = serde_json::to_string(&record.resources)?;

        let query = Query::insert()
            .into_table(Tasks::Table)
            .columns(TASK_COLUMNS)
            .values_panic([
                record.id.to_string().into(),
                record.user_id.to_string().into(),
                resources.into(),
                record.run_at.into(),
                record.obtained_at.into(),
                record.state.as_str().into(),
                i64::from(record.attempt_count).into(),
                record.description.into(),
                record.task_type.into(),
                record.payload.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let query = Query::select()
            .columns(TASK_COLUMNS)
            .from(Tasks::Table)
            .and_where(Expr::col(Tasks::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let query = Query::select()
            .columns(TASK_COLUMNS)
            .from(Tasks::Table)
            .order_by(Tasks::RunAt, Order::Asc)
            .order_by(Tasks::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let query = Query::delete()
            .from_table(Tasks::Table)
            .and_where(Expr::col(Tasks::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lease_next(&self, now: i64, abandon_before: i64) -> Result<Option<TaskRecord>> {
        // BEGIN IMMEDIATE takes the write lock before the select, so no other
        // connection can stamp the same row in between.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::lease_locked(&mut conn, now, abandon_before).await;

        match result {
            Ok(task) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(task)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn complete(&self, id: Uuid, lease: i64) -> Result<bool> {
        let query = Query::delete()
            .from_table(Tasks::Table)
            .and_where(Expr::col(Tasks::Id).eq(id.to_string()))
            .and_where(Expr::col(Tasks::ObtainedAt).eq(lease))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        lease: i64,
        attempt_count: u32,
        run_at: i64,
    ) -> Result<bool> {
        let query = Self::leased_update(
            id,
            lease,
            vec![
                (Tasks::ObtainedAt, Option::<i64>::None.into()),
                (Tasks::AttemptCount, i64::from(attempt_count).into()),
                (Tasks::RunAt, run_at.into()),
            ],
        );
        self.execute_matched(query).await
    }

    async fn fail_permanently(&self, id: Uuid, lease: i64, attempt_count: u32) -> Result<bool> {
        let query = Self::leased_update(
            id,
            lease,
            vec![
                (Tasks::ObtainedAt, Option::<i64>::None.into()),
                (Tasks::AttemptCount, i64::from(attempt_count).into()),
                (Tasks::State, TaskState::PermanentlyFailed.as_str().into()),
            ],
        );
        self.execute_matched(query).await
    }

    async fn delete_failed(&self) -> Result<u64> {
        let query = Query::delete()
            .from_table(Tasks::Table)
            .and_where(Expr::col(Tasks::State).eq(TaskState::PermanentlyFailed.as_str()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn release_abandoned(&self, abandon_before: i64) -> Result<u64> {
        let query = Query::update()
            .table(Tasks::Table)
            .values([(Tasks::ObtainedAt, Option::<i64>::None.into())])
            .and_where(Expr::col(Tasks::ObtainedAt).lt(abandon_before))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
