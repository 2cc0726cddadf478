//! Logical connections between two processes.

use serde::{Deserialize, Serialize};

use super::{ConnectionId, ProcessId};

/// One side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub process_id: ProcessId,
    pub interface_id: String,
    /// Negotiated interface version, set when the connection is created.
    #[serde(default)]
    pub interface_version_name: Option<String>,
}

impl Endpoint {
    pub fn new(process_id: ProcessId, interface_id: impl Into<String>) -> Self {
        Self {
            process_id,
            interface_id: interface_id.into(),
            interface_version_name: None,
        }
    }
}

/// A typed data channel between exactly two processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    /// Port the listening side binds for this connection.
    #[serde(default)]
    pub port: u16,
    pub endpoint1: Endpoint,
    pub endpoint2: Endpoint,
}

impl Connection {
    /// New, unvalidated connection with a fresh id.
    pub fn new(endpoint1: Endpoint, endpoint2: Endpoint) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            port: 0,
            endpoint1,
            endpoint2,
        }
    }

    pub fn endpoints(&self) -> [&Endpoint; 2] {
        [&self.endpoint1, &self.endpoint2]
    }

    pub fn involves(&self, process_id: ProcessId) -> bool {
        self.endpoint1.process_id == process_id || self.endpoint2.process_id == process_id
    }

    /// The endpoint belonging to `process_id`, if it takes part in this connection.
    pub fn endpoint_for(&self, process_id: ProcessId) -> Option<&Endpoint> {
        if self.endpoint1.process_id == process_id {
            Some(&self.endpoint1)
        } else if self.endpoint2.process_id == process_id {
            Some(&self.endpoint2)
        } else {
            None
        }
    }

    /// The endpoint opposite to the one of `process_id`.
    pub fn other_endpoint(&self, process_id: ProcessId) -> Option<&Endpoint> {
        if self.endpoint1.process_id == process_id {
            Some(&self.endpoint2)
        } else if self.endpoint2.process_id == process_id {
            Some(&self.endpoint1)
        } else {
            None
        }
    }

    /// True when both connections join the same (process, interface) pairs.
    pub fn joins_same_endpoints(&self, other: &Connection) -> bool {
        let same = |a: &Endpoint, b: &Endpoint| {
            a.process_id == b.process_id && a.interface_id == b.interface_id
        };
        (same(&self.endpoint1, &other.endpoint1) && same(&self.endpoint2, &other.endpoint2))
            || (same(&self.endpoint1, &other.endpoint2) && same(&self.endpoint2, &other.endpoint1))
    }
}
