//! Collaborators available to executing tasks.

use std::sync::Arc;

use crate::container::ContainerBackend;
use crate::resolver::ConnectionResolver;
use crate::session::ProcessController;
use crate::storage::{ConnectionStore, ProcessStore, ServiceRegistry};

use super::TaskQueue;

/// Everything a task may touch while executing.
///
/// Built once at startup and shared by all workers.
#[derive(Clone)]
pub struct TaskContext {
    pub processes: Arc<dyn ProcessStore>,
    pub connections: Arc<dyn ConnectionStore>,
    pub services: Arc<dyn ServiceRegistry>,
    pub containers: Arc<dyn ContainerBackend>,
    pub controller: Arc<ProcessController>,
    pub resolver: Arc<ConnectionResolver>,
    /// Where follow-on tasks are submitted.
    pub queue: Arc<TaskQueue>,
}
