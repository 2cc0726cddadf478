//! flotilla - orchestrator for containerized processes.
//!
//! Three subsystems carry the orchestration guarantee:
//! - [`queue`]: durable, retryable pending-change task queue with atomic leases
//! - [`session`]: per-process management sessions speaking the control protocol
//! - [`resolver`]: connection validation, version negotiation and auto-connect
//!
//! [`lifecycle`] is the user-facing entry point that turns requests into tasks.

pub mod config;
pub mod container;
pub mod lifecycle;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
