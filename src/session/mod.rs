//! Process sessions and the control protocol client.
//!
//! [`SessionManager`] owns one cached TCP session per process and performs
//! the request/reply exchange. [`ProcessController`] builds the lifecycle and
//! connection-endpoint operations on top of it and writes reported states
//! back to the process store.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{ConnectionId, ProcessId};
use crate::protocol::{FrameError, SerializationError};
use crate::storage::StorageError;

mod control;
mod manager;

pub use control::ProcessController;
pub use manager::{Session, SessionManager};

/// Errors raised by sessions and controller operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Malformed reply: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Session closed by peer")]
    Closed,

    #[error("Cannot resolve address of process {process_id}: {reason}")]
    Address {
        process_id: ProcessId,
        reason: String,
    },

    #[error("Process {process_id} is not an endpoint of connection {connection_id}")]
    NotAnEndpoint {
        connection_id: ConnectionId,
        process_id: ProcessId,
    },

    #[error("No resolved interface version for process {process_id} on interface {interface_id}")]
    MissingInterfaceVersion {
        process_id: ProcessId,
        interface_id: String,
    },
}

impl SessionError {
    /// Referenced data is absent; retrying cannot help.
    pub fn is_not_found(&self) -> bool {
        match self {
            SessionError::Storage(e) => e.is_not_found(),
            SessionError::NotAnEndpoint { .. } | SessionError::MissingInterfaceVersion { .. } => {
                true
            }
            _ => false,
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                SessionError::Closed
            }
            FrameError::Io(e) => SessionError::Io(e),
            FrameError::Serialization(e) => SessionError::Serialization(e),
        }
    }
}

// ============================================================================
// Address resolution
// ============================================================================

/// Maps a process to the network addresses the orchestrator and peers use.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// `host:port` of the process's management endpoint.
    async fn management_address(&self, process_id: ProcessId) -> Result<String, SessionError>;

    /// Host peers dial for data connections to this process.
    async fn data_host(&self, process_id: ProcessId) -> Result<String, SessionError>;
}

/// Containers are reachable by their process id as DNS name on the user network.
pub struct DnsAddressResolver {
    management_port: u16,
}

impl DnsAddressResolver {
    pub fn new(management_port: u16) -> Self {
        Self { management_port }
    }
}

#[async_trait]
impl AddressResolver for DnsAddressResolver {
    async fn management_address(&self, process_id: ProcessId) -> Result<String, SessionError> {
        Ok(format!("{}:{}", process_id, self.management_port))
    }

    async fn data_host(&self, process_id: ProcessId) -> Result<String, SessionError> {
        Ok(process_id.to_string())
    }
}

/// Explicit per-process management addresses.
#[derive(Default)]
pub struct StaticAddressResolver {
    addresses: RwLock<HashMap<ProcessId, SocketAddr>>,
}

impl StaticAddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, process_id: ProcessId, address: SocketAddr) {
        self.addresses.write().await.insert(process_id, address);
    }

    async fn lookup(&self, process_id: ProcessId) -> Result<SocketAddr, SessionError> {
        self.addresses
            .read()
            .await
            .get(&process_id)
            .copied()
            .ok_or_else(|| SessionError::Address {
                process_id,
                reason: "no address registered".to_string(),
            })
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn management_address(&self, process_id: ProcessId) -> Result<String, SessionError> {
        Ok(self.lookup(process_id).await?.to_string())
    }

    async fn data_host(&self, process_id: ProcessId) -> Result<String, SessionError> {
        Ok(self.lookup(process_id).await?.ip().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_dns_resolver_uses_process_id_host() {
        let resolver = DnsAddressResolver::new(4999);
        let id = Uuid::new_v4();
        assert_eq!(
            resolver.management_address(id).await.unwrap(),
            format!("{id}:4999")
        );
        assert_eq!(resolver.data_host(id).await.unwrap(), id.to_string());
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticAddressResolver::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            resolver.management_address(id).await,
            Err(SessionError::Address { .. })
        ));

        resolver
            .register(id, "127.0.0.1:7000".parse().unwrap())
            .await;
        assert_eq!(
            resolver.management_address(id).await.unwrap(),
            "127.0.0.1:7000"
        );
        assert_eq!(resolver.data_host(id).await.unwrap(), "127.0.0.1");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(SessionError::from(StorageError::not_found("process", "p")).is_not_found());
        assert!(!SessionError::Timeout("read").is_not_found());
        assert!(!SessionError::Closed.is_not_found());
    }

    #[test]
    fn test_eof_maps_to_closed() {
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            SessionError::from(FrameError::Io(eof)),
            SessionError::Closed
        ));
    }
}
