//! Container backend that shells out to the docker CLI.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{ContainerBackend, ContainerError};
use crate::config::ContainersConfig;
use crate::model::{NodeAssignment, Process, Service};

/// Runs `docker run` / `docker rm` through the configured binary.
///
/// Containers are named after the process id so the management session can
/// reach them by DNS on the per-user network.
pub struct DockerCliBackend {
    binary: String,
    network_prefix: String,
}

impl DockerCliBackend {
    pub fn new(config: &ContainersConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            network_prefix: config.network_prefix.clone(),
        }
    }

    /// Arguments for `docker run`, without the binary.
    pub fn run_args(&self, process: &Process, service: &Service, node: &NodeAssignment) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            process.id.to_string(),
            "--hostname".to_string(),
            process.id.to_string(),
            "--network".to_string(),
            format!("{}{}", self.network_prefix, process.user_id),
            "--label".to_string(),
            format!("flotilla.process={}", process.id),
            "--label".to_string(),
            format!("flotilla.user={}", process.user_id),
            "--label".to_string(),
            format!("flotilla.{}", node.placement()),
            "--env".to_string(),
            format!("FLOTILLA_PROCESS_ID={}", process.id),
        ];
        args.push(service.image.clone());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, ContainerError> {
        debug!(binary = %self.binary, ?args, "Invoking container runtime");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                error!(binary = %self.binary, error = %e, "Failed to invoke container runtime");
                ContainerError::Unavailable(e.to_string())
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(status = ?output.status, stderr = %stderr, "Container runtime refused request");
            Err(ContainerError::Rejected(stderr))
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerCliBackend {
    async fn start_container(
        &self,
        process: &Process,
        service: &Service,
        node: &NodeAssignment,
    ) -> Result<String, ContainerError> {
        let handle = self.run(&self.run_args(process, service, node)).await?;
        info!(process_id = %process.id, image = %service.image, handle = %handle, "Container started");
        Ok(handle)
    }

    async fn stop_container(&self, handle: &str) -> Result<bool, ContainerError> {
        match self.run(&["rm".to_string(), "--force".to_string(), handle.to_string()]).await {
            Ok(_) => {
                info!(handle = %handle, "Container removed");
                Ok(true)
            }
            Err(ContainerError::Rejected(stderr)) if stderr.contains("No such container") => {
                debug!(handle = %handle, "Container already gone");
                Ok(true)
            }
            Err(ContainerError::Rejected(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
