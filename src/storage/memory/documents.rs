//! In-memory process and connection stores.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{Connection, ConnectionId, Process, ProcessId, UserId};
use crate::storage::{ConnectionStore, ProcessStore, Result, StorageError};

/// Process documents in a map.
#[derive(Default)]
pub struct MemoryProcessStore {
    processes: RwLock<HashMap<ProcessId, Process>>,
    fail_on_put: RwLock<bool>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_put(&self, fail: bool) {
        *self.fail_on_put.write().await = fail;
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn get_process(&self, id: ProcessId) -> Result<Process> {
        self.processes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("process", id))
    }

    async fn put_process(&self, process: &Process) -> Result<()> {
        if *self.fail_on_put.read().await {
            return Err(StorageError::InvalidRecord("writes disabled".into()));
        }
        self.processes
            .write()
            .await
            .insert(process.id, process.clone());
        Ok(())
    }

    async fn delete_process(&self, id: ProcessId) -> Result<bool> {
        Ok(self.processes.write().await.remove(&id).is_some())
    }

    async fn list_processes(&self) -> Result<Vec<Process>> {
        Ok(self.processes.read().await.values().cloned().collect())
    }

    async fn list_processes_for_user(&self, user_id: UserId) -> Result<Vec<Process>> {
        Ok(self
            .processes
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Connection documents in a map.
#[derive(Default)]
pub struct MemoryConnectionStore {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl MemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn get_connection(&self, id: ConnectionId) -> Result<Connection> {
        self.connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("connection", id))
    }

    async fn put_connection(&self, connection: &Connection) -> Result<()> {
        self.connections
            .write()
            .await
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn delete_connection(&self, id: ConnectionId) -> Result<bool> {
        Ok(self.connections.write().await.remove(&id).is_some())
    }

    async fn connections_for_process(&self, process_id: ProcessId) -> Result<Vec<Connection>> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.involves(process_id))
            .cloned()
            .collect())
    }
}
