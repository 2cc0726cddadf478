//! Process documents.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{NodeId, ProcessId, UserId};

/// Lifecycle state of a process as recorded by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Starting,
    Initializing,
    Running,
    Suspended,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "STARTING",
            ProcessState::Initializing => "INITIALIZING",
            ProcessState::Running => "RUNNING",
            ProcessState::Suspended => "SUSPENDED",
            ProcessState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// Where a process is scheduled.
///
/// A process runs either on a private node of its owner or somewhere in a
/// public node pool, never both and never neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum NodeAssignment {
    PrivateNode(NodeId),
    NodePool(NodeId),
}

impl NodeAssignment {
    /// Container placement label used by the container backend.
    pub fn placement(&self) -> String {
        match self {
            NodeAssignment::PrivateNode(id) => format!("private-node={id}"),
            NodeAssignment::NodePool(id) => format!("node-pool={id}"),
        }
    }
}

/// A single configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessParameter {
    pub key: String,
    pub value: String,
}

impl ProcessParameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A running instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    pub user_id: UserId,
    pub service_id: String,
    pub node: NodeAssignment,
    pub state: ProcessState,
    /// Ordered configuration pushed to the process on start and update.
    #[serde(default)]
    pub configuration: Vec<ProcessParameter>,
    /// Opaque handle returned by the container backend.
    #[serde(default)]
    pub container_id: Option<String>,
}

impl Process {
    /// Create a process record that has not been started yet.
    pub fn new(user_id: UserId, service_id: impl Into<String>, node: NodeAssignment) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            service_id: service_id.into(),
            node,
            state: ProcessState::Starting,
            configuration: Vec::new(),
            container_id: None,
        }
    }

    /// Builder-style configuration setter.
    pub fn with_configuration(mut self, configuration: Vec<ProcessParameter>) -> Self {
        self.configuration = configuration;
        self
    }
}
