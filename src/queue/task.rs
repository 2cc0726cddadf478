//! The closed set of task kinds and their scheduling parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{Connection, NodeAssignment, ProcessId, ProcessParameter, UserId};
use crate::utils::retry::task_retry_delay;

/// Retry cap for kinds that do not override it.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 1000;

/// Retry cap for signals that are pointless to repeat for long.
const SHORT_MAX_RETRY_COUNT: u32 = 3;

/// One unit of orchestration work, with its payload.
///
/// Workflows chain by submitting the next kind on success:
/// - create: `CreateContainer` → `SendConfiguration`
/// - move: `SuspendProcess` → `MoveRemoveContainer` → `MoveCreateContainer`
///   → `ResumeProcess` → `ResumeConnectionEndpoint` ×2 per connection
/// - delete: `SendTerminateSignal` and `RemoveContainer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskKind {
    CreateContainer {
        process_id: ProcessId,
    },
    SendConfiguration {
        process_id: ProcessId,
    },
    ChangeConfiguration {
        process_id: ProcessId,
        configuration: Vec<ProcessParameter>,
    },
    SendTerminateSignal {
        process_id: ProcessId,
    },
    RemoveContainer {
        process_id: ProcessId,
    },
    CreateConnectionEndpoint {
        connection: Connection,
        process_id: ProcessId,
    },
    ResumeConnectionEndpoint {
        connection: Connection,
        process_id: ProcessId,
    },
    SuspendConnectionEndpoint {
        connection: Connection,
        process_id: ProcessId,
    },
    TerminateConnectionEndpoint {
        connection: Connection,
        process_id: ProcessId,
    },
    SuspendProcess {
        process_id: ProcessId,
        target: NodeAssignment,
    },
    MoveRemoveContainer {
        process_id: ProcessId,
        target: NodeAssignment,
        suspend_state: Vec<u8>,
    },
    MoveCreateContainer {
        process_id: ProcessId,
        target: NodeAssignment,
        suspend_state: Vec<u8>,
    },
    ResumeProcess {
        process_id: ProcessId,
        suspend_state: Vec<u8>,
    },
}

impl TaskKind {
    /// Stable name stored in the `task_type` column.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::CreateContainer { .. } => "CreateContainer",
            TaskKind::SendConfiguration { .. } => "SendConfiguration",
            TaskKind::ChangeConfiguration { .. } => "ChangeConfiguration",
            TaskKind::SendTerminateSignal { .. } => "SendTerminateSignal",
            TaskKind::RemoveContainer { .. } => "RemoveContainer",
            TaskKind::CreateConnectionEndpoint { .. } => "CreateConnectionEndpoint",
            TaskKind::ResumeConnectionEndpoint { .. } => "ResumeConnectionEndpoint",
            TaskKind::SuspendConnectionEndpoint { .. } => "SuspendConnectionEndpoint",
            TaskKind::TerminateConnectionEndpoint { .. } => "TerminateConnectionEndpoint",
            TaskKind::SuspendProcess { .. } => "SuspendProcess",
            TaskKind::MoveRemoveContainer { .. } => "MoveRemoveContainer",
            TaskKind::MoveCreateContainer { .. } => "MoveCreateContainer",
            TaskKind::ResumeProcess { .. } => "ResumeProcess",
        }
    }

    /// The process this task acts on.
    pub fn process_id(&self) -> ProcessId {
        match self {
            TaskKind::CreateContainer { process_id }
            | TaskKind::SendConfiguration { process_id }
            | TaskKind::ChangeConfiguration { process_id, .. }
            | TaskKind::SendTerminateSignal { process_id }
            | TaskKind::RemoveContainer { process_id }
            | TaskKind::CreateConnectionEndpoint { process_id, .. }
            | TaskKind::ResumeConnectionEndpoint { process_id, .. }
            | TaskKind::SuspendConnectionEndpoint { process_id, .. }
            | TaskKind::TerminateConnectionEndpoint { process_id, .. }
            | TaskKind::SuspendProcess { process_id, .. }
            | TaskKind::MoveRemoveContainer { process_id, .. }
            | TaskKind::MoveCreateContainer { process_id, .. }
            | TaskKind::ResumeProcess { process_id, .. } => *process_id,
        }
    }

    fn connection(&self) -> Option<&Connection> {
        match self {
            TaskKind::CreateConnectionEndpoint { connection, .. }
            | TaskKind::ResumeConnectionEndpoint { connection, .. }
            | TaskKind::SuspendConnectionEndpoint { connection, .. }
            | TaskKind::TerminateConnectionEndpoint { connection, .. } => Some(connection),
            _ => None,
        }
    }

    pub fn description(&self) -> String {
        let process_id = self.process_id();
        match self {
            TaskKind::CreateContainer { .. } => format!("Create container for process {process_id}"),
            TaskKind::SendConfiguration { .. } => {
                format!("Send initial configuration to process {process_id}")
            }
            TaskKind::ChangeConfiguration { .. } => {
                format!("Send updated configuration to process {process_id}")
            }
            TaskKind::SendTerminateSignal { .. } => {
                format!("Send terminate signal to process {process_id}")
            }
            TaskKind::RemoveContainer { .. } => format!("Remove container of process {process_id}"),
            TaskKind::CreateConnectionEndpoint { connection, .. }
            | TaskKind::ResumeConnectionEndpoint { connection, .. }
            | TaskKind::SuspendConnectionEndpoint { connection, .. }
            | TaskKind::TerminateConnectionEndpoint { connection, .. } => {
                let verb = match self {
                    TaskKind::CreateConnectionEndpoint { .. } => "Create",
                    TaskKind::ResumeConnectionEndpoint { .. } => "Resume",
                    TaskKind::SuspendConnectionEndpoint { .. } => "Suspend",
                    _ => "Terminate",
                };
                format!(
                    "{verb} endpoint of connection {} on process {process_id}",
                    connection.id
                )
            }
            TaskKind::SuspendProcess { target, .. } => {
                format!("Suspend process {process_id} to move it to {}", target.placement())
            }
            TaskKind::MoveRemoveContainer { .. } => {
                format!("Remove old container of moving process {process_id}")
            }
            TaskKind::MoveCreateContainer { target, .. } => {
                format!(
                    "Create container for moving process {process_id} on {}",
                    target.placement()
                )
            }
            TaskKind::ResumeProcess { .. } => format!("Resume process {process_id}"),
        }
    }

    /// Resource ids this task contends on.
    pub fn resources(&self, user_id: UserId) -> Vec<String> {
        let mut resources = Vec::with_capacity(2);
        if let Some(connection) = self.connection() {
            resources.push(connection.id.to_string());
        }
        resources.push(self.process_id().to_string());
        if matches!(
            self,
            TaskKind::CreateContainer { .. } | TaskKind::MoveCreateContainer { .. }
        ) {
            resources.push(user_id.to_string());
        }
        resources
    }

    /// Delay between submission and the first run.
    pub fn delay(&self) -> Duration {
        match self {
            TaskKind::SendConfiguration { .. } | TaskKind::SendTerminateSignal { .. } => {
                Duration::from_secs(2)
            }
            TaskKind::RemoveContainer { .. }
            | TaskKind::SuspendProcess { .. }
            | TaskKind::MoveCreateContainer { .. } => Duration::from_secs(5),
            _ => Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        match self {
            TaskKind::SendTerminateSignal { .. } | TaskKind::SuspendProcess { .. } => {
                Duration::from_secs(1)
            }
            _ => task_retry_delay(attempt),
        }
    }

    /// Temporary failures beyond this count turn permanent.
    pub fn max_retry_count(&self) -> u32 {
        match self {
            TaskKind::SendTerminateSignal { .. } | TaskKind::SuspendProcess { .. } => {
                SHORT_MAX_RETRY_COUNT
            }
            _ => DEFAULT_MAX_RETRY_COUNT,
        }
    }
}
