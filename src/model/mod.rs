//! Domain model: processes, services and their interfaces, connections.
//!
//! These are the persisted documents the task queue, session layer and
//! connection resolver read and write. Identifiers are UUIDs, except service
//! and interface identifiers which are names assigned by the service catalog.

mod connection;
mod process;
mod service;

pub use connection::{Connection, Endpoint};
pub use process::{NodeAssignment, Process, ProcessParameter, ProcessState};
pub use service::{Interface, InterfaceVersion, Service};

use uuid::Uuid;

/// Identifier of a process.
pub type ProcessId = Uuid;
/// Identifier of a user owning processes.
pub type UserId = Uuid;
/// Identifier of a logical connection.
pub type ConnectionId = Uuid;
/// Identifier of a node or node pool.
pub type NodeId = Uuid;
