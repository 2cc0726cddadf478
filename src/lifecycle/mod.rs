//! Process lifecycle entry points.
//!
//! Each operation validates the request, records the desired state, and
//! submits the tasks that carry it out. Nothing here talks to processes or
//! containers directly.

use std::sync::Arc;

use tracing::info;

use crate::model::{NodeAssignment, Process, ProcessId, ProcessParameter, UserId};
use crate::queue::{TaskKind, TaskQueue};
use crate::resolver::{ConnectionError, ConnectionResolver};
use crate::storage::{ConnectionStore, ProcessStore, ServiceRegistry, StorageError};

/// Errors returned to lifecycle callers.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl LifecycleError {
    pub fn is_not_found(&self) -> bool {
        match self {
            LifecycleError::Storage(e) => e.is_not_found(),
            LifecycleError::Connection(e) => e.is_not_found(),
            LifecycleError::Validation(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Requested changes to an existing process. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ProcessUpdate {
    pub user_id: Option<UserId>,
    pub node: Option<NodeAssignment>,
    pub configuration: Option<Vec<ProcessParameter>>,
}

pub struct ProcessLifecycle {
    processes: Arc<dyn ProcessStore>,
    connections: Arc<dyn ConnectionStore>,
    services: Arc<dyn ServiceRegistry>,
    resolver: Arc<ConnectionResolver>,
    queue: Arc<TaskQueue>,
}

impl ProcessLifecycle {
    pub fn new(
        processes: Arc<dyn ProcessStore>,
        connections: Arc<dyn ConnectionStore>,
        services: Arc<dyn ServiceRegistry>,
        resolver: Arc<ConnectionResolver>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            processes,
            connections,
            services,
            resolver,
            queue,
        }
    }

    fn check_node(node: &NodeAssignment) -> Result<()> {
        let id = match node {
            NodeAssignment::PrivateNode(id) | NodeAssignment::NodePool(id) => id,
        };
        if id.is_nil() {
            return Err(LifecycleError::Validation(
                "node assignment needs a node id".into(),
            ));
        }
        Ok(())
    }

    /// Record a new process and schedule its container.
    pub async fn create_process(
        &self,
        user_id: UserId,
        service_id: &str,
        node: NodeAssignment,
        configuration: Vec<ProcessParameter>,
    ) -> Result<Process> {
        Self::check_node(&node)?;
        self.services.get_service(service_id).await?;

        let process = Process::new(user_id, service_id, node).with_configuration(configuration);
        self.processes.put_process(&process).await?;
        self.queue
            .submit(
                user_id,
                TaskKind::CreateContainer {
                    process_id: process.id,
                },
            )
            .await?;

        info!(process_id = %process.id, %user_id, service_id, node = %node.placement(), "Process created");
        Ok(process)
    }

    /// Close all connections of a process, then stop and remove it.
    pub async fn delete_process(&self, process_id: ProcessId) -> Result<()> {
        let process = self.processes.get_process(process_id).await?;

        let terminated = self
            .resolver
            .terminate_connections_for_process(process_id)
            .await?;
        self.queue
            .submit(process.user_id, TaskKind::SendTerminateSignal { process_id })
            .await?;
        self.queue
            .submit(process.user_id, TaskKind::RemoveContainer { process_id })
            .await?;

        info!(%process_id, connections = terminated, "Process deletion scheduled");
        Ok(())
    }

    /// Apply an update. Moving a process and changing its configuration are
    /// scheduled independently.
    pub async fn update_process(
        &self,
        process_id: ProcessId,
        update: ProcessUpdate,
    ) -> Result<Process> {
        let process = self.processes.get_process(process_id).await?;

        if update.user_id.is_some_and(|user| user != process.user_id) {
            return Err(LifecycleError::Validation(format!(
                "process {process_id} cannot change owner"
            )));
        }

        if let Some(node) = update.node {
            if node != process.node {
                self.move_process(process_id, node).await?;
            }
        }

        if let Some(configuration) = update.configuration {
            if configuration != process.configuration {
                self.queue
                    .submit(
                        process.user_id,
                        TaskKind::ChangeConfiguration {
                            process_id,
                            configuration,
                        },
                    )
                    .await?;
            }
        }

        Ok(process)
    }

    /// Suspend every connection endpoint of the process, then the process itself.
    ///
    /// The rest of the move is chained from the suspension task.
    pub async fn move_process(&self, process_id: ProcessId, target: NodeAssignment) -> Result<()> {
        Self::check_node(&target)?;
        let process = self.processes.get_process(process_id).await?;

        let connections = self.connections.connections_for_process(process_id).await?;
        for connection in &connections {
            for endpoint in connection.endpoints() {
                self.queue
                    .submit(
                        process.user_id,
                        TaskKind::SuspendConnectionEndpoint {
                            connection: connection.clone(),
                            process_id: endpoint.process_id,
                        },
                    )
                    .await?;
            }
        }
        self.queue
            .submit(
                process.user_id,
                TaskKind::SuspendProcess { process_id, target },
            )
            .await?;

        info!(
            %process_id,
            from = %process.node.placement(),
            to = %target.placement(),
            connections = connections.len(),
            "Process move scheduled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionsConfig, QueueConfig};
    use crate::model::{Connection, Endpoint};
    use crate::storage::{
        MemoryConnectionStore, MemoryProcessStore, MemoryServiceRegistry, MemoryTaskStore,
    };
    use crate::test_utils::fixtures;
    use uuid::Uuid;

    struct Fixture {
        lifecycle: ProcessLifecycle,
        processes: Arc<MemoryProcessStore>,
        connections: Arc<MemoryConnectionStore>,
        queue: Arc<TaskQueue>,
    }

    fn fixture() -> Fixture {
        let processes = Arc::new(MemoryProcessStore::new());
        let connections = Arc::new(MemoryConnectionStore::new());
        let services = Arc::new(MemoryServiceRegistry::with_services([fixtures::service(
            "sensor",
            vec![fixtures::interface("telemetry")],
        )]));
        let queue = Arc::new(TaskQueue::new(
            Arc::new(MemoryTaskStore::new()),
            &QueueConfig::default(),
        ));
        let resolver = Arc::new(ConnectionResolver::new(
            processes.clone(),
            connections.clone(),
            services.clone(),
            queue.clone(),
            ConnectionsConfig::default(),
        ));
        let lifecycle = ProcessLifecycle::new(
            processes.clone(),
            connections.clone(),
            services,
            resolver,
            queue.clone(),
        );
        Fixture {
            lifecycle,
            processes,
            connections,
            queue,
        }
    }

    async fn task_names(queue: &TaskQueue) -> Vec<&'static str> {
        queue
            .list()
            .await
            .unwrap()
            .iter()
            .map(|t| t.kind.name())
            .collect()
    }

    #[tokio::test]
    async fn test_create_process_schedules_container() {
        let f = fixture();
        let user = Uuid::new_v4();
        let process = f
            .lifecycle
            .create_process(
                user,
                "sensor",
                fixtures::node(),
                vec![ProcessParameter::new("rate", "10")],
            )
            .await
            .unwrap();

        let stored = f.processes.get_process(process.id).await.unwrap();
        assert_eq!(stored.state, crate::model::ProcessState::Starting);
        assert_eq!(stored.configuration.len(), 1);
        assert_eq!(task_names(&f.queue).await, vec!["CreateContainer"]);
    }

    #[tokio::test]
    async fn test_create_process_unknown_service() {
        let f = fixture();
        let err = f
            .lifecycle
            .create_process(Uuid::new_v4(), "nope", fixtures::node(), vec![])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.queue.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_process_requires_node() {
        let f = fixture();
        let err = f
            .lifecycle
            .create_process(
                Uuid::new_v4(),
                "sensor",
                NodeAssignment::PrivateNode(Uuid::nil()),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_process_closes_connections_first() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = f
            .lifecycle
            .create_process(user, "sensor", fixtures::node(), vec![])
            .await
            .unwrap();
        let b = f
            .lifecycle
            .create_process(user, "sensor", fixtures::node(), vec![])
            .await
            .unwrap();
        let connection = Connection::new(
            Endpoint::new(a.id, "telemetry"),
            Endpoint::new(b.id, "telemetry"),
        );
        f.connections.put_connection(&connection).await.unwrap();

        f.lifecycle.delete_process(a.id).await.unwrap();

        let names = task_names(&f.queue).await;
        assert_eq!(
            names
                .iter()
                .filter(|n| **n == "TerminateConnectionEndpoint")
                .count(),
            2
        );
        assert!(names.contains(&"SendTerminateSignal"));
        assert!(names.contains(&"RemoveContainer"));
        assert!(f
            .connections
            .connections_for_process(a.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_owner_change() {
        let f = fixture();
        let process = f
            .lifecycle
            .create_process(Uuid::new_v4(), "sensor", fixtures::node(), vec![])
            .await
            .unwrap();

        let err = f
            .lifecycle
            .update_process(
                process.id,
                ProcessUpdate {
                    user_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_schedules_move_and_configuration() {
        let f = fixture();
        let process = f
            .lifecycle
            .create_process(Uuid::new_v4(), "sensor", fixtures::node(), vec![])
            .await
            .unwrap();

        f.lifecycle
            .update_process(
                process.id,
                ProcessUpdate {
                    user_id: Some(process.user_id),
                    node: Some(NodeAssignment::PrivateNode(Uuid::new_v4())),
                    configuration: Some(vec![ProcessParameter::new("rate", "20")]),
                },
            )
            .await
            .unwrap();

        let names = task_names(&f.queue).await;
        assert!(names.contains(&"SuspendProcess"));
        assert!(names.contains(&"ChangeConfiguration"));
    }

    #[tokio::test]
    async fn test_unchanged_update_schedules_nothing() {
        let f = fixture();
        let process = f
            .lifecycle
            .create_process(Uuid::new_v4(), "sensor", fixtures::node(), vec![])
            .await
            .unwrap();

        f.lifecycle
            .update_process(
                process.id,
                ProcessUpdate {
                    node: Some(process.node),
                    configuration: Some(vec![]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(task_names(&f.queue).await, vec!["CreateContainer"]);
    }
}
