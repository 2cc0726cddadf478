//! In-memory container backend for tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ContainerBackend, ContainerError};
use crate::model::{NodeAssignment, Process, ProcessId, Service};

/// A container the mock backend pretends to run.
#[derive(Debug, Clone, PartialEq)]
pub struct MockContainer {
    pub process_id: ProcessId,
    pub image: String,
    pub node: NodeAssignment,
}

/// Records start/stop calls; never touches a real runtime.
#[derive(Default)]
pub struct MockContainerBackend {
    running: RwLock<HashMap<String, MockContainer>>,
    started: RwLock<u32>,
    stopped: RwLock<Vec<String>>,
    fail_on_start: RwLock<bool>,
}

impl MockContainerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_start(&self, fail: bool) {
        *self.fail_on_start.write().await = fail;
    }

    /// Containers currently running, by handle.
    pub async fn running(&self) -> HashMap<String, MockContainer> {
        self.running.read().await.clone()
    }

    pub async fn start_count(&self) -> u32 {
        *self.started.read().await
    }

    pub async fn stopped(&self) -> Vec<String> {
        self.stopped.read().await.clone()
    }
}

#[async_trait]
impl ContainerBackend for MockContainerBackend {
    async fn start_container(
        &self,
        process: &Process,
        service: &Service,
        node: &NodeAssignment,
    ) -> Result<String, ContainerError> {
        if *self.fail_on_start.read().await {
            return Err(ContainerError::Unavailable("mock start disabled".into()));
        }
        let mut started = self.started.write().await;
        *started += 1;
        let handle = format!("mock-{}-{}", process.id, *started);
        self.running.write().await.insert(
            handle.clone(),
            MockContainer {
                process_id: process.id,
                image: service.image.clone(),
                node: *node,
            },
        );
        Ok(handle)
    }

    async fn stop_container(&self, handle: &str) -> Result<bool, ContainerError> {
        self.stopped.write().await.push(handle.to_string());
        Ok(self.running.write().await.remove(handle).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_start_then_stop() {
        let backend = MockContainerBackend::new();
        let node = NodeAssignment::PrivateNode(Uuid::new_v4());
        let process = Process::new(Uuid::new_v4(), "svc", node);
        let service = Service {
            id: "svc".into(),
            name: String::new(),
            image: "img".into(),
            interfaces: vec![],
        };

        let handle = backend
            .start_container(&process, &service, &node)
            .await
            .unwrap();
        assert_eq!(backend.running().await[&handle].node, node);
        assert!(backend.stop_container(&handle).await.unwrap());
        assert!(!backend.stop_container(&handle).await.unwrap());
        assert!(backend.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_on_start() {
        let backend = MockContainerBackend::new();
        backend.set_fail_on_start(true).await;
        let node = NodeAssignment::NodePool(Uuid::new_v4());
        let process = Process::new(Uuid::new_v4(), "svc", node);
        let service = Service {
            id: "svc".into(),
            name: String::new(),
            image: "img".into(),
            interfaces: vec![],
        };
        assert!(backend
            .start_container(&process, &service, &node)
            .await
            .is_err());
    }
}
