//! SQLite process and connection stores.
//!
//! Documents are stored as JSON beside the columns used for lookups.

use async_trait::async_trait;
use sea_query::{Cond, Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::model::{Connection, ConnectionId, Process, ProcessId, UserId};
use crate::storage::schema::{
    Connections, Processes, CREATE_CONNECTIONS_TABLE, CREATE_PROCESSES_TABLE,
};
use crate::storage::{ConnectionStore, ProcessStore, Result, StorageError};

/// SQLite implementation of ProcessStore.
pub struct SqliteProcessStore {
    pool: SqlitePool,
}

impl SqliteProcessStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_PROCESSES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_documents(&self, query: String) -> Result<Vec<Process>> {
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<Process> {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }
}

#[async_trait]
impl ProcessStore for SqliteProcessStore {
    async fn get_process(&self, id: ProcessId) -> Result<Process> {
        let query = Query::select()
            .column(Processes::Document)
            .from(Processes::Table)
            .and_where(Expr::col(Processes::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        self.fetch_documents(query)
            .await?
            .pop()
            .ok_or_else(|| StorageError::not_found("process", id))
    }

    async fn put_process(&self, process: &Process) -> Result<()> {
        let document = serde_json::to_string(process)?;

        let query = Query::insert()
            .into_table(Processes::Table)
            .columns([
                Processes::Id,
                Processes::UserId,
                Processes::ServiceId,
                Processes::Document,
            ])
            .values_panic([
                process.id.to_string().into(),
                process.user_id.to_string().into(),
                process.service_id.clone().into(),
                document.into(),
            ])
            .on_conflict(
                OnConflict::column(Processes::Id)
                    .update_columns([
                        Processes::UserId,
                        Processes::ServiceId,
                        Processes::Document,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_process(&self, id: ProcessId) -> Result<bool> {
        let query = Query::delete()
            .from_table(Processes::Table)
            .and_where(Expr::col(Processes::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_processes(&self) -> Result<Vec<Process>> {
        let query = Query::select()
            .column(Processes::Document)
            .from(Processes::Table)
            .to_string(SqliteQueryBuilder);

        self.fetch_documents(query).await
    }

    async fn list_processes_for_user(&self, user_id: UserId) -> Result<Vec<Process>> {
        let query = Query::select()
            .column(Processes::Document)
            .from(Processes::Table)
            .and_where(Expr::col(Processes::UserId).eq(user_id.to_string()))
            .to_string(SqliteQueryBuilder);

        self.fetch_documents(query).await
    }
}

/// SQLite implementation of ConnectionStore.
pub struct SqliteConnectionStore {
    pool: SqlitePool,
}

impl SqliteConnectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_CONNECTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_documents(&self, query: String) -> Result<Vec<Connection>> {
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<Connection> {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn get_connection(&self, id: ConnectionId) -> Result<Connection> {
        let query = Query::select()
            .column(Connections::Document)
            .from(Connections::Table)
            .and_where(Expr::col(Connections::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        self.fetch_documents(query)
            .await?
            .pop()
            .ok_or_else(|| StorageError::not_found("connection", id))
    }

    async fn put_connection(&self, connection: &Connection) -> Result<()> {
        let document = serde_json::to_string(connection)?;

        let query = Query::insert()
            .into_table(Connections::Table)
            .columns([
                Connections::Id,
                Connections::Process1,
                Connections::Process2,
                Connections::Document,
            ])
            .values_panic([
                connection.id.to_string().into(),
                connection.endpoint1.process_id.to_string().into(),
                connection.endpoint2.process_id.to_string().into(),
                document.into(),
            ])
            .on_conflict(
                OnConflict::column(Connections::Id)
                    .update_columns([
                        Connections::Process1,
                        Connections::Process2,
                        Connections::Document,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_connection(&self, id: ConnectionId) -> Result<bool> {
        let query = Query::delete()
            .from_table(Connections::Table)
            .and_where(Expr::col(Connections::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn connections_for_process(&self, process_id: ProcessId) -> Result<Vec<Connection>> {
        let id = process_id.to_string();
        let query = Query::select()
            .column(Connections::Document)
            .from(Connections::Table)
            .cond_where(
                Cond::any()
                    .add(Expr::col(Connections::Process1).eq(id.as_str()))
                    .add(Expr::col(Connections::Process2).eq(id.as_str())),
            )
            .to_string(SqliteQueryBuilder);

        self.fetch_documents(query).await
    }
}
