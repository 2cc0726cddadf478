//! Management wire protocol.
//!
//! Every message travels as one frame: `[u32 big-endian length][envelope]`.
//! The envelope names its message type so the receiver can decode it without
//! knowing in advance what the peer sent:
//!
//! ```text
//! [u8 name length][type name, utf-8][protobuf body]
//! ```
//!
//! Anything that fails to decode is a [`SerializationError`], never a panic.

mod codec;
mod frame;
mod messages;

pub use codec::{Envelope, Reply, SerializationError};
pub use frame::{read_frame, write_frame, FrameError};
pub use messages::{
    ConnectionHandshake, ConnectionMessage, ConnectionMode, ConnectionStateCode, ErrorMessage,
    GoToProcessState, ProcessStateCode, ProcessStateUpdate, ResumeProcess, SetConfig,
};
