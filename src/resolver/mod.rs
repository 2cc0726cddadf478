//! Connection compatibility resolution.
//!
//! Validates proposed connections between two process interfaces, negotiates
//! the interface versions each side speaks, and discovers connections to make
//! automatically when a process comes up.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ConnectionsConfig;
use crate::model::{
    Connection, ConnectionId, Endpoint, Interface, InterfaceVersion, Process, ProcessId, Service,
    UserId,
};
use crate::queue::{TaskKind, TaskQueue};
use crate::storage::{ConnectionStore, ProcessStore, ServiceRegistry, StorageError};

/// Why a connection was refused.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid connection: {0}")]
    Validation(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Interface {interface_id} not found on service {service_id}")]
    InterfaceNotFound {
        service_id: String,
        interface_id: String,
    },

    #[error("Interfaces {0} and {1} have no compatible versions")]
    Incompatible(String, String),

    #[error("Process {process_id} already has a connection on interface {interface_id}")]
    MultipleNotAllowed {
        process_id: ProcessId,
        interface_id: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConnectionError {
    /// Referenced data is absent; retrying cannot help.
    pub fn is_not_found(&self) -> bool {
        match self {
            ConnectionError::ProcessNotFound(_)
            | ConnectionError::ServiceNotFound(_)
            | ConnectionError::InterfaceNotFound { .. } => true,
            ConnectionError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, ConnectionError>;

/// Pick the version pair a connection will speak.
///
/// Both version lists are scanned in sorted order and the last compatible
/// pair wins, so later versions are preferred.
pub fn negotiate_versions(
    interface1: &Interface,
    interface2: &Interface,
) -> Option<(InterfaceVersion, InterfaceVersion)> {
    let mut versions1 = interface1.versions.clone();
    let mut versions2 = interface2.versions.clone();
    versions1.sort();
    versions2.sort();

    let mut chosen = None;
    for v1 in &versions1 {
        for v2 in &versions2 {
            if v1.is_compatible_with(v2) {
                chosen = Some((v1, v2));
            }
        }
    }
    chosen.map(|(v1, v2)| (v1.clone(), v2.clone()))
}

/// Everything a proposed connection refers to, looked up once.
struct Resolved {
    owner: UserId,
    interface1: Interface,
    interface2: Interface,
}

/// Validates, creates and tears down connections.
pub struct ConnectionResolver {
    processes: Arc<dyn ProcessStore>,
    connections: Arc<dyn ConnectionStore>,
    services: Arc<dyn ServiceRegistry>,
    queue: Arc<TaskQueue>,
    config: ConnectionsConfig,
}

impl ConnectionResolver {
    pub fn new(
        processes: Arc<dyn ProcessStore>,
        connections: Arc<dyn ConnectionStore>,
        services: Arc<dyn ServiceRegistry>,
        queue: Arc<TaskQueue>,
        config: ConnectionsConfig,
    ) -> Self {
        Self {
            processes,
            connections,
            services,
            queue,
            config,
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check a proposed connection, failing on the first violated rule.
    pub async fn validate(&self, connection: &Connection) -> Result<()> {
        self.resolve(connection).await.map(|_| ())
    }

    async fn resolve(&self, connection: &Connection) -> Result<Resolved> {
        let (e1, e2) = (&connection.endpoint1, &connection.endpoint2);

        if e1.process_id.is_nil() || e2.process_id.is_nil() {
            return Err(ConnectionError::Validation(
                "both endpoints need a process".into(),
            ));
        }
        if e1.process_id == e2.process_id {
            return Err(ConnectionError::Validation(format!(
                "process {} cannot connect to itself",
                e1.process_id
            )));
        }
        if e1.interface_id.is_empty() || e2.interface_id.is_empty() {
            return Err(ConnectionError::Validation(
                "both endpoints need an interface".into(),
            ));
        }

        let process1 = self.process(e1.process_id).await?;
        let process2 = self.process(e2.process_id).await?;
        let service1 = self.service(&process1.service_id).await?;
        let service2 = self.service(&process2.service_id).await?;
        let interface1 = Self::interface(&service1, &e1.interface_id)?;
        let interface2 = Self::interface(&service2, &e2.interface_id)?;

        let gateway = &self.config.dashboard_gateway_service_id;
        if process1.user_id != process2.user_id
            && service1.id != *gateway
            && service2.id != *gateway
        {
            return Err(ConnectionError::Validation(format!(
                "processes {} and {} belong to different users",
                process1.id, process2.id
            )));
        }

        if !interface1.is_compatible_with(&interface2) {
            return Err(ConnectionError::Incompatible(
                interface1.id.clone(),
                interface2.id.clone(),
            ));
        }

        Ok(Resolved {
            owner: process1.user_id,
            interface1,
            interface2,
        })
    }

    async fn process(&self, id: ProcessId) -> Result<Process> {
        match self.processes.get_process(id).await {
            Err(e) if e.is_not_found() => Err(ConnectionError::ProcessNotFound(id)),
            other => Ok(other?),
        }
    }

    async fn service(&self, id: &str) -> Result<Service> {
        match self.services.get_service(id).await {
            Err(e) if e.is_not_found() => Err(ConnectionError::ServiceNotFound(id.to_string())),
            other => Ok(other?),
        }
    }

    fn interface(service: &Service, interface_id: &str) -> Result<Interface> {
        service
            .interface(interface_id)
            .cloned()
            .ok_or_else(|| ConnectionError::InterfaceNotFound {
                service_id: service.id.clone(),
                interface_id: interface_id.to_string(),
            })
    }

    /// Reject the connection if an endpoint's interface is single-use and taken.
    pub async fn validate_multiplicity(&self, connection: &Connection) -> Result<()> {
        let resolved = self.resolve(connection).await?;
        self.check_multiplicity(connection, &resolved).await
    }

    async fn check_multiplicity(&self, connection: &Connection, resolved: &Resolved) -> Result<()> {
        let sides = [
            (&connection.endpoint1, &resolved.interface1),
            (&connection.endpoint2, &resolved.interface2),
        ];
        for (endpoint, interface) in sides {
            if interface.allow_multiple {
                continue;
            }
            let existing = self
                .connections
                .connections_for_process(endpoint.process_id)
                .await?;
            let taken = existing.iter().any(|other| {
                other.id != connection.id
                    && other
                        .endpoint_for(endpoint.process_id)
                        .is_some_and(|e| e.interface_id == endpoint.interface_id)
            });
            if taken {
                return Err(ConnectionError::MultipleNotAllowed {
                    process_id: endpoint.process_id,
                    interface_id: endpoint.interface_id.clone(),
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Connection operations
    // ========================================================================

    /// Validate, persist and schedule both endpoints of a new connection.
    pub async fn create_connection(&self, mut connection: Connection) -> Result<Connection> {
        let resolved = self.resolve(&connection).await?;
        self.check_multiplicity(&connection, &resolved).await?;

        let (version1, version2) = negotiate_versions(&resolved.interface1, &resolved.interface2)
            .ok_or_else(|| {
                ConnectionError::Incompatible(
                    resolved.interface1.id.clone(),
                    resolved.interface2.id.clone(),
                )
            })?;
        connection.endpoint1.interface_version_name = Some(version1.version_name);
        connection.endpoint2.interface_version_name = Some(version2.version_name);
        connection.id = Uuid::new_v4();
        connection.port = self.pick_port();

        self.connections.put_connection(&connection).await?;
        info!(
            connection_id = %connection.id,
            process1 = %connection.endpoint1.process_id,
            process2 = %connection.endpoint2.process_id,
            port = connection.port,
            "Connection created"
        );

        let owner = resolved.owner;
        for endpoint in connection.endpoints() {
            self.queue
                .submit(
                    owner,
                    TaskKind::CreateConnectionEndpoint {
                        connection: connection.clone(),
                        process_id: endpoint.process_id,
                    },
                )
                .await?;
        }

        Ok(connection)
    }

    fn pick_port(&self) -> u16 {
        let start = u32::from(self.config.port_range_start);
        let end = (start + u32::from(self.config.port_range_size.max(1))).min(u32::from(u16::MAX) + 1);
        let port = rand::rng().random_range(start..end);
        u16::try_from(port).unwrap_or(self.config.port_range_start)
    }

    /// Tell both endpoints to close and forget the connection.
    ///
    /// Returns `false` when no such connection exists.
    pub async fn terminate_connection(&self, connection_id: ConnectionId) -> Result<bool> {
        let connection = match self.connections.get_connection(connection_id).await {
            Ok(connection) => connection,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match self.owner_of(&connection).await? {
            Some(owner) => {
                for endpoint in connection.endpoints() {
                    self.queue
                        .submit(
                            owner,
                            TaskKind::TerminateConnectionEndpoint {
                                connection: connection.clone(),
                                process_id: endpoint.process_id,
                            },
                        )
                        .await?;
                }
            }
            None => warn!(%connection_id, "Neither endpoint process exists, dropping connection"),
        }

        let deleted = self.connections.delete_connection(connection_id).await?;
        info!(%connection_id, "Connection terminated");
        Ok(deleted)
    }

    /// Terminate every connection of `process_id`. Returns how many were terminated.
    pub async fn terminate_connections_for_process(&self, process_id: ProcessId) -> Result<usize> {
        let mut terminated = 0;
        for connection in self.connections.connections_for_process(process_id).await? {
            if self.terminate_connection(connection.id).await? {
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    async fn owner_of(&self, connection: &Connection) -> Result<Option<UserId>> {
        for endpoint in connection.endpoints() {
            match self.processes.get_process(endpoint.process_id).await {
                Ok(process) => return Ok(Some(process.user_id)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// The running dashboard gateway process, if any.
    pub async fn dashboard_gateway(&self) -> Result<Option<Process>> {
        let gateway = &self.config.dashboard_gateway_service_id;
        Ok(self
            .processes
            .list_processes()
            .await?
            .into_iter()
            .find(|p| p.service_id == *gateway))
    }

    // ========================================================================
    // Auto-connect
    // ========================================================================

    /// Connect every auto-connect interface of `process_id` to compatible peers.
    ///
    /// Failures on individual candidates are logged and skipped. Returns the
    /// number of connections created.
    pub async fn auto_connect(&self, process_id: ProcessId) -> Result<usize> {
        let process = self.process(process_id).await?;
        let service = self.service(&process.service_id).await?;
        let own: Vec<&Interface> = service.interfaces.iter().filter(|i| i.auto_connect).collect();
        if own.is_empty() {
            return Ok(0);
        }

        let mut candidates = if process.service_id == self.config.dashboard_gateway_service_id {
            self.processes.list_processes().await?
        } else {
            let mut candidates = self.processes.list_processes_for_user(process.user_id).await?;
            if let Some(gateway) = self.dashboard_gateway().await? {
                if gateway.user_id != process.user_id {
                    candidates.push(gateway);
                }
            }
            candidates
        };
        candidates.retain(|c| c.id != process_id);

        let mut existing = self.connections.connections_for_process(process_id).await?;
        let mut created = 0;

        for candidate in candidates {
            let peer_service = match self.services.get_service(&candidate.service_id).await {
                Ok(service) => service,
                Err(e) => {
                    warn!(process_id = %candidate.id, error = %e, "Skipping auto-connect candidate");
                    continue;
                }
            };

            for interface in &own {
                for peer in peer_service.interfaces.iter().filter(|i| i.auto_connect) {
                    if !interface.is_compatible_with(peer) {
                        continue;
                    }
                    let proposal = Connection::new(
                        Endpoint::new(process_id, interface.id.clone()),
                        Endpoint::new(candidate.id, peer.id.clone()),
                    );
                    if existing.iter().any(|c| c.joins_same_endpoints(&proposal)) {
                        continue;
                    }

                    match self.create_connection(proposal).await {
                        Ok(connection) => {
                            created += 1;
                            existing.push(connection);
                        }
                        Err(e) => warn!(
                            %process_id,
                            peer = %candidate.id,
                            interface = %interface.id,
                            error = %e,
                            "Auto-connect skipped"
                        ),
                    }
                }
            }
        }

        if created > 0 {
            info!(%process_id, created, "Auto-connected process");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::model::NodeAssignment;
    use crate::storage::{MemoryConnectionStore, MemoryProcessStore, MemoryServiceRegistry, MemoryTaskStore};
    use crate::test_utils::fixtures;

    struct Fixture {
        resolver: ConnectionResolver,
        processes: Arc<MemoryProcessStore>,
        connections: Arc<MemoryConnectionStore>,
        queue: Arc<TaskQueue>,
    }

    fn fixture() -> Fixture {
        let processes = Arc::new(MemoryProcessStore::new());
        let connections = Arc::new(MemoryConnectionStore::new());
        let services = Arc::new(MemoryServiceRegistry::with_services([
            fixtures::service("sensor", vec![fixtures::auto_interface("telemetry")]),
            fixtures::service("logger", vec![fixtures::auto_interface("telemetry")]),
            fixtures::service(
                "exclusive",
                vec![Interface {
                    allow_multiple: false,
                    ..fixtures::interface("telemetry")
                }],
            ),
            fixtures::service("dashboard-gateway", vec![fixtures::auto_interface("telemetry")]),
            fixtures::service("other", vec![fixtures::interface_with_hashes("control", "x", "y")]),
        ]));
        let queue = Arc::new(TaskQueue::new(
            Arc::new(MemoryTaskStore::new()),
            &QueueConfig::default(),
        ));
        let resolver = ConnectionResolver::new(
            processes.clone(),
            connections.clone(),
            services,
            queue.clone(),
            ConnectionsConfig::default(),
        );
        Fixture {
            resolver,
            processes,
            connections,
            queue,
        }
    }

    async fn process(f: &Fixture, user: UserId, service: &str) -> Process {
        let process = Process::new(user, service, NodeAssignment::NodePool(Uuid::nil()));
        f.processes.put_process(&process).await.unwrap();
        process
    }

    fn proposal(a: &Process, b: &Process, interface: &str) -> Connection {
        Connection::new(Endpoint::new(a.id, interface), Endpoint::new(b.id, interface))
    }

    #[test]
    fn test_negotiation_prefers_latest_compatible_pair() {
        let mut a = fixtures::interface("telemetry");
        let mut b = fixtures::interface("telemetry");
        a.versions = vec![
            InterfaceVersion::new("1.0", "r1", "s1"),
            InterfaceVersion::new("2.0", "r2", "s2"),
            InterfaceVersion::new("3.0", "r3", "s3"),
        ];
        b.versions = vec![
            InterfaceVersion::new("2.1", "s2", "r2"),
            InterfaceVersion::new("1.1", "s1", "r1"),
        ];

        let (v1, v2) = negotiate_versions(&a, &b).unwrap();
        assert_eq!(v1.version_name, "2.0");
        assert_eq!(v2.version_name, "2.1");
    }

    #[test]
    fn test_negotiation_fails_without_overlap() {
        let a = fixtures::interface_with_hashes("control", "x", "y");
        let b = fixtures::interface_with_hashes("control", "x", "y");
        assert!(negotiate_versions(&a, &b).is_none());
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let f = fixture();
        let a = process(&f, Uuid::new_v4(), "sensor").await;
        let result = f.resolver.validate(&proposal(&a, &a, "telemetry")).await;
        assert!(matches!(result, Err(ConnectionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_empty_interface_rejected_before_lookup() {
        let f = fixture();
        let connection = proposal(
            &Process::new(Uuid::new_v4(), "sensor", NodeAssignment::NodePool(Uuid::nil())),
            &Process::new(Uuid::new_v4(), "sensor", NodeAssignment::NodePool(Uuid::nil())),
            "",
        );
        let result = f.resolver.validate(&connection).await;
        assert!(matches!(result, Err(ConnectionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_interface_is_not_found() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "sensor").await;
        let b = process(&f, user, "logger").await;

        let err = f
            .resolver
            .validate(&proposal(&a, &b, "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InterfaceNotFound { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unknown_process_is_not_found() {
        let f = fixture();
        let a = process(&f, Uuid::new_v4(), "sensor").await;
        let ghost = Process::new(a.user_id, "logger", NodeAssignment::NodePool(Uuid::nil()));
        let err = f
            .resolver
            .validate(&proposal(&a, &ghost, "telemetry"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ProcessNotFound(id) if id == ghost.id));
    }

    #[tokio::test]
    async fn test_cross_user_only_through_gateway() {
        let f = fixture();
        let a = process(&f, Uuid::new_v4(), "sensor").await;
        let b = process(&f, Uuid::new_v4(), "logger").await;
        let gateway = process(&f, Uuid::new_v4(), "dashboard-gateway").await;

        assert!(matches!(
            f.resolver.validate(&proposal(&a, &b, "telemetry")).await,
            Err(ConnectionError::Validation(_))
        ));
        f.resolver
            .validate(&proposal(&a, &gateway, "telemetry"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_incompatible_interfaces_rejected() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "other").await;
        let b = process(&f, user, "other").await;
        assert!(matches!(
            f.resolver.validate(&proposal(&a, &b, "control")).await,
            Err(ConnectionError::Incompatible(_, _))
        ));
    }

    #[tokio::test]
    async fn test_create_connection_negotiates_and_schedules_endpoints() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "sensor").await;
        let b = process(&f, user, "logger").await;

        let connection = f
            .resolver
            .create_connection(proposal(&a, &b, "telemetry"))
            .await
            .unwrap();

        assert_eq!(
            connection.endpoint1.interface_version_name.as_deref(),
            Some(fixtures::VERSION)
        );
        assert!((5000..10000).contains(&connection.port));
        assert_eq!(
            f.connections.get_connection(connection.id).await.unwrap(),
            connection
        );

        let tasks = f.queue.list().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks
            .iter()
            .all(|t| t.kind.name() == "CreateConnectionEndpoint" && t.user_id == user));
    }

    #[tokio::test]
    async fn test_single_use_interface_refuses_second_connection() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "exclusive").await;
        let b = process(&f, user, "sensor").await;
        let c = process(&f, user, "logger").await;

        f.resolver
            .create_connection(proposal(&a, &b, "telemetry"))
            .await
            .unwrap();
        let err = f
            .resolver
            .create_connection(proposal(&a, &c, "telemetry"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::MultipleNotAllowed { process_id, .. } if process_id == a.id));
    }

    #[tokio::test]
    async fn test_terminate_connection_schedules_both_sides() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "sensor").await;
        let b = process(&f, user, "logger").await;
        let connection = f
            .resolver
            .create_connection(proposal(&a, &b, "telemetry"))
            .await
            .unwrap();

        assert!(f.resolver.terminate_connection(connection.id).await.unwrap());
        assert!(!f.resolver.terminate_connection(connection.id).await.unwrap());

        let terminations = f
            .queue
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind.name() == "TerminateConnectionEndpoint")
            .count();
        assert_eq!(terminations, 2);
        assert!(f.connections.connections_for_process(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_connect_same_user_and_gateway() {
        let f = fixture();
        let user = Uuid::new_v4();
        let a = process(&f, user, "sensor").await;
        let b = process(&f, user, "logger").await;
        let stranger = process(&f, Uuid::new_v4(), "logger").await;
        let gateway = process(&f, Uuid::new_v4(), "dashboard-gateway").await;

        assert_eq!(f.resolver.auto_connect(a.id).await.unwrap(), 2);

        let peers: Vec<ProcessId> = f
            .connections
            .connections_for_process(a.id)
            .await
            .unwrap()
            .iter()
            .filter_map(|c| c.other_endpoint(a.id).map(|e| e.process_id))
            .collect();
        assert!(peers.contains(&b.id));
        assert!(peers.contains(&gateway.id));
        assert!(!peers.contains(&stranger.id));

        // Already connected pairs are not duplicated.
        assert_eq!(f.resolver.auto_connect(a.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gateway_auto_connects_to_everyone() {
        let f = fixture();
        process(&f, Uuid::new_v4(), "sensor").await;
        process(&f, Uuid::new_v4(), "logger").await;
        let gateway = process(&f, Uuid::new_v4(), "dashboard-gateway").await;

        assert_eq!(f.resolver.auto_connect(gateway.id).await.unwrap(), 2);
        assert_eq!(
            f.resolver.dashboard_gateway().await.unwrap().map(|p| p.id),
            Some(gateway.id)
        );
    }
}
