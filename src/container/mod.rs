//! Container backend boundary.
//!
//! The orchestrator only needs two things from a container runtime: start a
//! process's image on its assigned node, and stop a previously started
//! container by handle.

use async_trait::async_trait;

use crate::model::{NodeAssignment, Process, Service};

mod docker_cli;
mod mock;

pub use docker_cli::DockerCliBackend;
pub use mock::MockContainerBackend;

/// Errors from the container backend.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The runtime could not be reached or did not answer.
    #[error("Container backend unavailable: {0}")]
    Unavailable(String),

    /// The runtime answered but refused the request.
    #[error("Container backend rejected request: {0}")]
    Rejected(String),
}

/// Starts and stops process containers.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Start `service`'s image for `process` on `node`, returning an opaque handle.
    async fn start_container(
        &self,
        process: &Process,
        service: &Service,
        node: &NodeAssignment,
    ) -> Result<String, ContainerError>;

    /// Stop and remove a container. `Ok(false)` when the runtime did not confirm.
    async fn stop_container(&self, handle: &str) -> Result<bool, ContainerError>;
}
