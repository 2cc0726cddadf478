//! Lifecycle and connection-endpoint operations over management sessions.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{SessionError, SessionManager};
use crate::model::{Connection, ProcessId, ProcessParameter, ProcessState};
use crate::protocol::{
    ConnectionHandshake, ConnectionMessage, ConnectionMode, ConnectionStateCode,
    GoToProcessState, ProcessStateCode, ProcessStateUpdate, ResumeProcess, SetConfig,
};
use crate::storage::{ProcessStore, ServiceRegistry};

type Result<T> = std::result::Result<T, SessionError>;

/// Drives processes through state transitions and records what they report.
///
/// Every operation returns `Ok(false)` / `Ok(None)` when the process did not
/// give the expected reply; callers treat that as a transient failure.
pub struct ProcessController {
    sessions: Arc<SessionManager>,
    processes: Arc<dyn ProcessStore>,
    services: Arc<dyn ServiceRegistry>,
}

impl ProcessController {
    pub fn new(
        sessions: Arc<SessionManager>,
        processes: Arc<dyn ProcessStore>,
        services: Arc<dyn ServiceRegistry>,
    ) -> Self {
        Self {
            sessions,
            processes,
            services,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ========================================================================
    // Process lifecycle
    // ========================================================================

    /// Push the stored configuration to a freshly started process.
    pub async fn start(&self, process_id: ProcessId) -> Result<bool> {
        let process = self.processes.get_process(process_id).await?;
        self.send_configuration(process_id, &process.configuration, false)
            .await
    }

    /// Push an updated configuration to a running process.
    pub async fn reconfigure(
        &self,
        process_id: ProcessId,
        configuration: &[ProcessParameter],
    ) -> Result<bool> {
        self.send_configuration(process_id, configuration, true)
            .await
    }

    async fn send_configuration(
        &self,
        process_id: ProcessId,
        configuration: &[ProcessParameter],
        is_update: bool,
    ) -> Result<bool> {
        let request = SetConfig {
            process_id: process_id.to_string(),
            is_update,
            config: configuration
                .iter()
                .map(|p| (p.key.clone(), p.value.clone()))
                .collect(),
        };

        let Some(update) = self
            .sessions
            .exchange::<ProcessStateUpdate>(process_id, request)
            .await?
        else {
            return Ok(false);
        };

        self.record_state(process_id, &update).await?;
        Ok(true)
    }

    /// Suspend a process, returning the blob needed to resume it.
    pub async fn suspend(&self, process_id: ProcessId) -> Result<Option<Vec<u8>>> {
        let update = self
            .go_to_state(process_id, ProcessStateCode::Suspended)
            .await?;
        Ok(update.map(|u| u.state_data))
    }

    /// Ask a process to terminate.
    pub async fn terminate(&self, process_id: ProcessId) -> Result<bool> {
        let update = self
            .go_to_state(process_id, ProcessStateCode::Terminated)
            .await?;
        Ok(update.is_some())
    }

    async fn go_to_state(
        &self,
        process_id: ProcessId,
        target: ProcessStateCode,
    ) -> Result<Option<ProcessStateUpdate>> {
        let request = GoToProcessState {
            process_id: process_id.to_string(),
            target_state: target as i32,
        };

        let Some(update) = self
            .sessions
            .exchange::<ProcessStateUpdate>(process_id, request)
            .await?
        else {
            return Ok(None);
        };

        let reached = self.record_state(process_id, &update).await?;
        if reached != Some(target.into()) {
            error!(
                process_id = %process_id,
                target = ?target,
                reached = ?reached,
                "Process did not reach requested state"
            );
        }

        // The process is going away or restarting elsewhere.
        self.sessions.disconnect(process_id).await;
        Ok(Some(update))
    }

    /// Hand a suspended process its state blob back.
    pub async fn resume(&self, process_id: ProcessId, state_data: &[u8]) -> Result<bool> {
        let request = ResumeProcess {
            process_id: process_id.to_string(),
            state_data: state_data.to_vec(),
        };

        let Some(update) = self
            .sessions
            .exchange::<ProcessStateUpdate>(process_id, request)
            .await?
        else {
            return Ok(false);
        };

        let reached = self.record_state(process_id, &update).await?;
        if reached != Some(ProcessState::Running) {
            error!(
                process_id = %process_id,
                reached = ?reached,
                "Process did not resume into RUNNING"
            );
        }
        Ok(true)
    }

    /// Persist the state carried by `update`, returning it.
    async fn record_state(
        &self,
        process_id: ProcessId,
        update: &ProcessStateUpdate,
    ) -> Result<Option<ProcessState>> {
        match update.process_state() {
            Some(state) => {
                self.processes.set_state(process_id, state).await?;
                info!(process_id = %process_id, state = %state, "Process state updated");
                Ok(Some(state))
            }
            None => {
                warn!(process_id = %process_id, code = update.state, "Unknown process state code");
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Connection endpoints
    // ========================================================================

    pub async fn create_endpoint(&self, connection: &Connection, process_id: ProcessId) -> Result<bool> {
        self.endpoint_request(connection, process_id, ConnectionMode::Create)
            .await
    }

    pub async fn resume_endpoint(&self, connection: &Connection, process_id: ProcessId) -> Result<bool> {
        self.endpoint_request(connection, process_id, ConnectionMode::Resume)
            .await
    }

    pub async fn suspend_endpoint(&self, connection: &Connection, process_id: ProcessId) -> Result<bool> {
        self.endpoint_request(connection, process_id, ConnectionMode::Suspend)
            .await
    }

    pub async fn terminate_endpoint(
        &self,
        connection: &Connection,
        process_id: ProcessId,
    ) -> Result<bool> {
        self.endpoint_request(connection, process_id, ConnectionMode::Terminate)
            .await
    }

    async fn endpoint_request(
        &self,
        connection: &Connection,
        process_id: ProcessId,
        mode: ConnectionMode,
    ) -> Result<bool> {
        let request = self.connection_message(connection, process_id, mode).await?;

        let Some(handshake) = self
            .sessions
            .exchange::<ConnectionHandshake>(process_id, request)
            .await?
        else {
            return Ok(false);
        };

        let expected = match mode {
            ConnectionMode::Create | ConnectionMode::Resume => ConnectionStateCode::Connected,
            ConnectionMode::Suspend => ConnectionStateCode::Suspended,
            ConnectionMode::Terminate => ConnectionStateCode::Terminated,
        };
        let state = handshake.state();
        if state == Some(expected) {
            debug!(
                connection_id = %connection.id,
                process_id = %process_id,
                mode = ?mode,
                "Endpoint acknowledged"
            );
        } else {
            warn!(
                connection_id = %connection.id,
                process_id = %process_id,
                mode = ?mode,
                expected = ?expected,
                state = ?state,
                "Endpoint acknowledged in unexpected state"
            );
        }
        Ok(true)
    }

    /// Describe `process_id`'s endpoint of `connection` to that process.
    ///
    /// The side with the lower process id dials; the other side gets an empty
    /// target address and listens.
    pub async fn connection_message(
        &self,
        connection: &Connection,
        process_id: ProcessId,
        mode: ConnectionMode,
    ) -> Result<ConnectionMessage> {
        let (own, remote) = match (
            connection.endpoint_for(process_id),
            connection.other_endpoint(process_id),
        ) {
            (Some(own), Some(remote)) => (own, remote),
            _ => {
                return Err(SessionError::NotAnEndpoint {
                    connection_id: connection.id,
                    process_id,
                })
            }
        };

        let mut message = ConnectionMessage {
            connection_id: connection.id.to_string(),
            mode: mode as i32,
            listen_port: u32::from(connection.port),
            remote_process_id: remote.process_id.to_string(),
            remote_interface_id: remote.interface_id.clone(),
            ..Default::default()
        };

        if matches!(mode, ConnectionMode::Suspend | ConnectionMode::Terminate) {
            return Ok(message);
        }

        let own_process = self.processes.get_process(process_id).await?;
        let remote_process = self.processes.get_process(remote.process_id).await?;
        let own_service = self.services.get_service(&own_process.service_id).await?;

        let missing_version = || SessionError::MissingInterfaceVersion {
            process_id,
            interface_id: own.interface_id.clone(),
        };
        let version_name = own
            .interface_version_name
            .as_deref()
            .ok_or_else(missing_version)?;
        let version = own_service
            .interface(&own.interface_id)
            .and_then(|i| i.version(version_name))
            .ok_or_else(missing_version)?;

        message.receive_hash = version.receives_hash.clone();
        message.send_hash = version.sends_hash.clone();
        message.remote_service_id = remote_process.service_id.clone();
        if process_id < remote.process_id {
            let host = self
                .sessions
                .addresses()
                .data_host(remote.process_id)
                .await?;
            message.target_address = format!("tcp://{}:{}", host, connection.port);
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::model::{Endpoint, Interface, InterfaceVersion, NodeAssignment, Process, Service};
    use crate::session::StaticAddressResolver;
    use crate::storage::{MemoryProcessStore, MemoryServiceRegistry};
    use crate::test_utils::{FakeBehavior, FakeProcess};
    use uuid::Uuid;

    struct Fixture {
        controller: ProcessController,
        processes: Arc<MemoryProcessStore>,
        connection: Connection,
        low: Uuid,
        high: Uuid,
        fakes: Vec<FakeProcess>,
    }

    async fn fixture() -> Fixture {
        let interface = Interface {
            id: "power".into(),
            name: "Power".into(),
            versions: vec![InterfaceVersion::new("v1", "rx1", "tx1")],
            allow_multiple: false,
            auto_connect: false,
        };
        let services = Arc::new(MemoryServiceRegistry::with_services([Service {
            id: "meter".into(),
            name: "Meter".into(),
            image: "meter:1".into(),
            interfaces: vec![interface],
        }]));
        let processes = Arc::new(MemoryProcessStore::new());
        let addresses = Arc::new(StaticAddressResolver::new());

        let user = Uuid::new_v4();
        let node = NodeAssignment::NodePool(Uuid::new_v4());
        let mut ids = Vec::new();
        let mut fakes = Vec::new();
        for _ in 0..2 {
            let mut process = Process::new(user, "meter", node);
            process.state = ProcessState::Initializing;
            process.configuration = vec![ProcessParameter::new("rate", "5")];
            processes.put_process(&process).await.unwrap();
            let fake = FakeProcess::start().await;
            addresses.register(process.id, fake.address()).await;
            ids.push(process.id);
            fakes.push(fake);
        }
        let (low, high) = if ids[0] < ids[1] {
            (ids[0], ids[1])
        } else {
            (ids[1], ids[0])
        };
        if ids[0] > ids[1] {
            fakes.reverse();
        }

        let mut e1 = Endpoint::new(high, "power");
        e1.interface_version_name = Some("v1".into());
        let mut e2 = Endpoint::new(low, "power");
        e2.interface_version_name = Some("v1".into());
        let mut connection = Connection::new(e1, e2);
        connection.port = 5555;

        let sessions = Arc::new(SessionManager::new(
            processes.clone(),
            addresses,
            SessionConfig {
                io_timeout_ms: 200,
                ..SessionConfig::default()
            },
        ));
        Fixture {
            controller: ProcessController::new(sessions, processes.clone(), services),
            processes,
            connection,
            low,
            high,
            fakes,
        }
    }

    #[tokio::test]
    async fn test_start_pushes_configuration_and_records_state() {
        let f = fixture().await;
        assert!(f.controller.start(f.low).await.unwrap());

        let process = f.processes.get_process(f.low).await.unwrap();
        assert_eq!(process.state, ProcessState::Running);

        let requests = f.fakes[0].set_config_requests().await;
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].is_update);
        assert_eq!(requests[0].config.get("rate").map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn test_reconfigure_marks_update() {
        let f = fixture().await;
        let configuration = vec![ProcessParameter::new("rate", "9")];
        assert!(f.controller.reconfigure(f.low, &configuration).await.unwrap());
        let requests = f.fakes[0].set_config_requests().await;
        assert!(requests[0].is_update);
        assert_eq!(requests[0].config.get("rate").map(String::as_str), Some("9"));
    }

    #[tokio::test]
    async fn test_suspend_returns_state_and_closes_session() {
        let f = fixture().await;
        let state = f.controller.suspend(f.low).await.unwrap().unwrap();
        assert_eq!(state, FakeProcess::SUSPEND_STATE);
        assert_eq!(
            f.processes.get_process(f.low).await.unwrap().state,
            ProcessState::Suspended
        );
        assert!(!f.controller.sessions().is_connected(f.low).await);
    }

    #[tokio::test]
    async fn test_error_reply_leaves_state_unchanged() {
        let f = fixture().await;
        f.fakes[0].set_behavior(FakeBehavior::ErrorReply).await;
        assert!(f.controller.suspend(f.low).await.unwrap().is_none());
        assert_eq!(
            f.processes.get_process(f.low).await.unwrap().state,
            ProcessState::Initializing
        );
    }

    #[tokio::test]
    async fn test_resume_in_wrong_state_still_acknowledged() {
        let f = fixture().await;
        f.fakes[0]
            .set_behavior(FakeBehavior::ReportState(ProcessStateCode::Suspended))
            .await;
        assert!(f.controller.resume(f.low, b"blob").await.unwrap());
        assert_eq!(
            f.processes.get_process(f.low).await.unwrap().state,
            ProcessState::Suspended
        );
    }

    #[tokio::test]
    async fn test_lower_id_dials_higher_id_listens() {
        let f = fixture().await;
        let dialer = f
            .controller
            .connection_message(&f.connection, f.low, ConnectionMode::Create)
            .await
            .unwrap();
        assert_eq!(dialer.target_address, "tcp://127.0.0.1:5555");
        assert_eq!(dialer.listen_port, 5555);
        assert_eq!(dialer.receive_hash, "rx1");
        assert_eq!(dialer.send_hash, "tx1");
        assert_eq!(dialer.remote_process_id, f.high.to_string());
        assert_eq!(dialer.remote_service_id, "meter");

        let listener = f
            .controller
            .connection_message(&f.connection, f.high, ConnectionMode::Create)
            .await
            .unwrap();
        assert!(listener.target_address.is_empty());
        assert_eq!(listener.remote_process_id, f.low.to_string());
    }

    #[tokio::test]
    async fn test_endpoint_without_version_rejected() {
        let mut f = fixture().await;
        f.connection.endpoint1.interface_version_name = None;
        let err = f
            .controller
            .create_endpoint(&f.connection, f.high)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingInterfaceVersion { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_foreign_process_not_an_endpoint() {
        let f = fixture().await;
        let err = f
            .controller
            .suspend_endpoint(&f.connection, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAnEndpoint { .. }));
    }

    #[tokio::test]
    async fn test_endpoint_operations_acknowledged() {
        let f = fixture().await;
        assert!(f.controller.create_endpoint(&f.connection, f.low).await.unwrap());
        assert!(f.controller.suspend_endpoint(&f.connection, f.low).await.unwrap());
        assert!(f.controller.resume_endpoint(&f.connection, f.low).await.unwrap());
        assert!(f.controller.terminate_endpoint(&f.connection, f.low).await.unwrap());

        let modes: Vec<_> = f.fakes[0]
            .connection_messages()
            .await
            .iter()
            .map(|m| m.connection_mode())
            .collect();
        assert_eq!(
            modes,
            [
                Some(ConnectionMode::Create),
                Some(ConnectionMode::Suspend),
                Some(ConnectionMode::Resume),
                Some(ConnectionMode::Terminate)
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_error() {
        let f = fixture().await;
        f.fakes[0].set_behavior(FakeBehavior::Silent).await;
        let err = f.controller.terminate(f.low).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(!err.is_not_found());
    }
}
