//! What each task kind does when executed.

use tracing::{debug, info, warn};

use super::{PendingChange, TaskContext, TaskKind, TaskOutcome};
use crate::container::ContainerError;
use crate::model::{Connection, NodeAssignment, ProcessId, ProcessParameter, ProcessState};
use crate::resolver::ConnectionError;
use crate::session::SessionError;
use crate::storage::{StorageError, TaskState};

/// Attempts `RemoveContainer` waits for a process's connections to be torn down.
const CONNECTION_DRAIN_ATTEMPTS: u32 = 10;

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl StepError {
    fn is_not_found(&self) -> bool {
        match self {
            StepError::Storage(e) => e.is_not_found(),
            StepError::Session(e) => e.is_not_found(),
            StepError::Connection(e) => e.is_not_found(),
            StepError::Container(_) => false,
        }
    }
}

type Step = Result<TaskOutcome, StepError>;

/// `Success` when the process acknowledged, otherwise worth retrying.
fn acknowledged(ok: bool) -> TaskOutcome {
    if ok {
        TaskOutcome::Success
    } else {
        TaskOutcome::FailedTemporary
    }
}

/// Run one task. Never fails; errors are folded into the outcome.
pub(super) async fn execute(task: &PendingChange, ctx: &TaskContext) -> TaskOutcome {
    let result = match &task.kind {
        TaskKind::CreateContainer { process_id } => create_container(ctx, task, *process_id).await,
        TaskKind::SendConfiguration { process_id } => send_configuration(ctx, *process_id).await,
        TaskKind::ChangeConfiguration {
            process_id,
            configuration,
        } => change_configuration(ctx, *process_id, configuration).await,
        TaskKind::SendTerminateSignal { process_id } => ctx
            .controller
            .terminate(*process_id)
            .await
            .map(acknowledged)
            .map_err(StepError::from),
        TaskKind::RemoveContainer { process_id } => remove_container(ctx, task, *process_id).await,
        TaskKind::CreateConnectionEndpoint {
            connection,
            process_id,
        } => ctx
            .controller
            .create_endpoint(connection, *process_id)
            .await
            .map(acknowledged)
            .map_err(StepError::from),
        TaskKind::ResumeConnectionEndpoint {
            connection,
            process_id,
        } => ctx
            .controller
            .resume_endpoint(connection, *process_id)
            .await
            .map(acknowledged)
            .map_err(StepError::from),
        TaskKind::SuspendConnectionEndpoint {
            connection,
            process_id,
        } => ctx
            .controller
            .suspend_endpoint(connection, *process_id)
            .await
            .map(acknowledged)
            .map_err(StepError::from),
        TaskKind::TerminateConnectionEndpoint {
            connection,
            process_id,
        } => ctx
            .controller
            .terminate_endpoint(connection, *process_id)
            .await
            .map(acknowledged)
            .map_err(StepError::from),
        TaskKind::SuspendProcess { process_id, target } => {
            suspend_process(ctx, task, *process_id, *target).await
        }
        TaskKind::MoveRemoveContainer {
            process_id,
            target,
            suspend_state,
        } => move_remove_container(ctx, task, *process_id, *target, suspend_state).await,
        TaskKind::MoveCreateContainer {
            process_id,
            target,
            suspend_state,
        } => move_create_container(ctx, task, *process_id, *target, suspend_state).await,
        TaskKind::ResumeProcess {
            process_id,
            suspend_state,
        } => resume_process(ctx, task, *process_id, suspend_state).await,
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_not_found() => {
            warn!(task_id = %task.id, error = %e, "Task references missing data");
            TaskOutcome::FailedPermanently
        }
        Err(e) => {
            warn!(task_id = %task.id, attempt = task.attempt_count, error = %e, "Task failed");
            TaskOutcome::FailedTemporary
        }
    }
}

// ============================================================================
// Creation and configuration
// ============================================================================

async fn create_container(ctx: &TaskContext, task: &PendingChange, process_id: ProcessId) -> Step {
    let mut process = ctx.processes.get_process(process_id).await?;

    if process.container_id.is_none() {
        let service = ctx.services.get_service(&process.service_id).await?;
        let handle = ctx
            .containers
            .start_container(&process, &service, &process.node)
            .await?;
        info!(%process_id, container = %handle, node = %process.node.placement(), "Container started");
        process.container_id = Some(handle);
        process.state = ProcessState::Initializing;
        ctx.processes.put_process(&process).await?;
    }

    ctx.queue
        .submit(task.user_id, TaskKind::SendConfiguration { process_id })
        .await?;
    Ok(TaskOutcome::Success)
}

async fn send_configuration(ctx: &TaskContext, process_id: ProcessId) -> Step {
    if !ctx.controller.start(process_id).await? {
        return Ok(TaskOutcome::FailedTemporary);
    }

    match ctx.resolver.auto_connect(process_id).await {
        Ok(created) => debug!(%process_id, created, "Auto-connect finished"),
        Err(e) => warn!(%process_id, error = %e, "Auto-connect failed"),
    }
    Ok(TaskOutcome::Success)
}

async fn change_configuration(
    ctx: &TaskContext,
    process_id: ProcessId,
    configuration: &[ProcessParameter],
) -> Step {
    if !ctx.controller.reconfigure(process_id, configuration).await? {
        return Ok(TaskOutcome::FailedTemporary);
    }

    let mut process = ctx.processes.get_process(process_id).await?;
    process.configuration = configuration.to_vec();
    ctx.processes.put_process(&process).await?;
    Ok(TaskOutcome::Success)
}

// ============================================================================
// Removal
// ============================================================================

async fn remove_container(ctx: &TaskContext, task: &PendingChange, process_id: ProcessId) -> Step {
    let process = match ctx.processes.get_process(process_id).await {
        Ok(process) => process,
        Err(e) if e.is_not_found() => {
            debug!(%process_id, "Process already removed");
            return Ok(TaskOutcome::Success);
        }
        Err(e) => return Err(e.into()),
    };

    // Records of connections opened meanwhile, or endpoint teardowns still queued.
    let remaining = ctx.connections.connections_for_process(process_id).await?.len();
    let tearing_down = pending_teardowns(ctx, process_id).await?;
    if remaining + tearing_down > 0 && task.attempt_count < CONNECTION_DRAIN_ATTEMPTS {
        debug!(%process_id, remaining, tearing_down, "Waiting for connections to close");
        return Ok(TaskOutcome::FailedTemporary);
    }

    ctx.controller.sessions().disconnect(process_id).await;
    if let Some(handle) = &process.container_id {
        if !ctx.containers.stop_container(handle).await? {
            return Ok(TaskOutcome::FailedTemporary);
        }
    }

    ctx.processes.delete_process(process_id).await?;
    info!(%process_id, "Process removed");
    Ok(TaskOutcome::Success)
}

/// Queued `TerminateConnectionEndpoint` tasks for connections of `process_id`.
async fn pending_teardowns(ctx: &TaskContext, process_id: ProcessId) -> Result<usize, StepError> {
    let tasks = ctx.queue.list().await?;
    Ok(tasks
        .iter()
        .filter(|t| t.state == TaskState::Pending)
        .filter(|t| {
            matches!(
                &t.kind,
                TaskKind::TerminateConnectionEndpoint { connection, .. }
                    if connection.involves(process_id)
            )
        })
        .count())
}

// ============================================================================
// Move workflow
// ============================================================================

async fn suspend_process(
    ctx: &TaskContext,
    task: &PendingChange,
    process_id: ProcessId,
    target: NodeAssignment,
) -> Step {
    let Some(suspend_state) = ctx.controller.suspend(process_id).await? else {
        return Ok(TaskOutcome::FailedTemporary);
    };

    ctx.queue
        .submit(
            task.user_id,
            TaskKind::MoveRemoveContainer {
                process_id,
                target,
                suspend_state,
            },
        )
        .await?;
    Ok(TaskOutcome::Success)
}

async fn move_remove_container(
    ctx: &TaskContext,
    task: &PendingChange,
    process_id: ProcessId,
    target: NodeAssignment,
    suspend_state: &[u8],
) -> Step {
    let mut process = ctx.processes.get_process(process_id).await?;
    ctx.controller.sessions().disconnect(process_id).await;

    if let Some(handle) = process.container_id.clone() {
        if !ctx.containers.stop_container(&handle).await? {
            return Ok(TaskOutcome::FailedTemporary);
        }
        process.container_id = None;
        ctx.processes.put_process(&process).await?;
    }

    ctx.queue
        .submit(
            task.user_id,
            TaskKind::MoveCreateContainer {
                process_id,
                target,
                suspend_state: suspend_state.to_vec(),
            },
        )
        .await?;
    Ok(TaskOutcome::Success)
}

async fn move_create_container(
    ctx: &TaskContext,
    task: &PendingChange,
    process_id: ProcessId,
    target: NodeAssignment,
    suspend_state: &[u8],
) -> Step {
    let mut process = ctx.processes.get_process(process_id).await?;

    if process.container_id.is_none() {
        let service = ctx.services.get_service(&process.service_id).await?;
        process.node = target;
        let handle = ctx
            .containers
            .start_container(&process, &service, &target)
            .await?;
        info!(%process_id, container = %handle, node = %target.placement(), "Container moved");
        process.container_id = Some(handle);
        ctx.processes.put_process(&process).await?;
    }

    ctx.queue
        .submit(
            task.user_id,
            TaskKind::ResumeProcess {
                process_id,
                suspend_state: suspend_state.to_vec(),
            },
        )
        .await?;
    Ok(TaskOutcome::Success)
}

async fn resume_process(
    ctx: &TaskContext,
    task: &PendingChange,
    process_id: ProcessId,
    suspend_state: &[u8],
) -> Step {
    if !ctx.controller.resume(process_id, suspend_state).await? {
        return Ok(TaskOutcome::FailedTemporary);
    }

    let connections = ctx.connections.connections_for_process(process_id).await?;
    for connection in connections {
        resume_both_endpoints(ctx, task, connection).await?;
    }
    Ok(TaskOutcome::Success)
}

async fn resume_both_endpoints(
    ctx: &TaskContext,
    task: &PendingChange,
    connection: Connection,
) -> Result<(), StepError> {
    for endpoint in connection.endpoints() {
        ctx.queue
            .submit(
                task.user_id,
                TaskKind::ResumeConnectionEndpoint {
                    connection: connection.clone(),
                    process_id: endpoint.process_id,
                },
            )
            .await?;
    }
    Ok(())
}
