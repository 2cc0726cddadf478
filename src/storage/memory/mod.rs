//! In-memory storage implementations.
//!
//! Used for tests and for `storage.type = memory`. Locks are held across each
//! whole operation, which makes `lease_next` trivially atomic.

mod documents;
mod service_registry;
mod task_store;

pub use documents::{MemoryConnectionStore, MemoryProcessStore};
pub use service_registry::MemoryServiceRegistry;
pub use task_store::MemoryTaskStore;
