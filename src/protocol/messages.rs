//! Protobuf message definitions for the management protocol.

use std::collections::BTreeMap;

use crate::model::ProcessState;

/// Process lifecycle state as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProcessStateCode {
    Starting = 0,
    Initializing = 1,
    Running = 2,
    Suspended = 3,
    Terminated = 4,
}

impl From<ProcessStateCode> for ProcessState {
    fn from(code: ProcessStateCode) -> Self {
        match code {
            ProcessStateCode::Starting => ProcessState::Starting,
            ProcessStateCode::Initializing => ProcessState::Initializing,
            ProcessStateCode::Running => ProcessState::Running,
            ProcessStateCode::Suspended => ProcessState::Suspended,
            ProcessStateCode::Terminated => ProcessState::Terminated,
        }
    }
}

impl From<ProcessState> for ProcessStateCode {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Starting => ProcessStateCode::Starting,
            ProcessState::Initializing => ProcessStateCode::Initializing,
            ProcessState::Running => ProcessStateCode::Running,
            ProcessState::Suspended => ProcessStateCode::Suspended,
            ProcessState::Terminated => ProcessStateCode::Terminated,
        }
    }
}

/// What a connection-endpoint request asks the process to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionMode {
    Create = 0,
    Resume = 1,
    Suspend = 2,
    Terminate = 3,
}

/// State of one connection endpoint as reported by the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionStateCode {
    Starting = 0,
    Connected = 1,
    Suspended = 2,
    Interrupted = 3,
    Terminated = 4,
}

/// Push configuration to a process; `is_update` distinguishes reconfiguration from start.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetConfig {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(bool, tag = "2")]
    pub is_update: bool,
    #[prost(btree_map = "string, string", tag = "3")]
    pub config: BTreeMap<String, String>,
}

/// Reply carrying the state a process reached, plus an opaque state blob.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProcessStateUpdate {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(enumeration = "ProcessStateCode", tag = "2")]
    pub state: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub state_data: Vec<u8>,
}

impl ProcessStateUpdate {
    /// Decoded state, `None` for codes this build does not know.
    pub fn process_state(&self) -> Option<ProcessState> {
        ProcessStateCode::try_from(self.state).ok().map(Into::into)
    }
}

/// Ask a process to move to SUSPENDED or TERMINATED.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GoToProcessState {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(enumeration = "ProcessStateCode", tag = "2")]
    pub target_state: i32,
}

/// Hand a previously obtained state blob back to a process.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResumeProcess {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub state_data: Vec<u8>,
}

/// Describes one endpoint of a logical connection to the process owning it.
///
/// `target_address` is the `tcp://host:port` to dial. Empty means the
/// process listens on `listen_port`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionMessage {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(enumeration = "ConnectionMode", tag = "2")]
    pub mode: i32,
    #[prost(string, tag = "3")]
    pub target_address: String,
    #[prost(uint32, tag = "4")]
    pub listen_port: u32,
    #[prost(string, tag = "5")]
    pub receive_hash: String,
    #[prost(string, tag = "6")]
    pub send_hash: String,
    #[prost(string, tag = "7")]
    pub remote_process_id: String,
    #[prost(string, tag = "8")]
    pub remote_interface_id: String,
    #[prost(string, tag = "9")]
    pub remote_service_id: String,
}

impl ConnectionMessage {
    pub fn connection_mode(&self) -> Option<ConnectionMode> {
        ConnectionMode::try_from(self.mode).ok()
    }
}

/// Acknowledgement of a connection-endpoint request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionHandshake {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(enumeration = "ConnectionStateCode", tag = "2")]
    pub connection_state: i32,
}

impl ConnectionHandshake {
    pub fn state(&self) -> Option<ConnectionStateCode> {
        ConnectionStateCode::try_from(self.connection_state).ok()
    }
}

/// Sent by a process in place of the expected reply when it cannot comply.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorMessage {
    #[prost(string, tag = "1")]
    pub process_id: String,
    #[prost(string, tag = "2")]
    pub debug_information: String,
}
