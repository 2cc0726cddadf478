//! SQLite implementations of storage interfaces.

mod documents;
mod task_store;

pub use documents::{SqliteConnectionStore, SqliteProcessStore};
pub use task_store::SqliteTaskStore;

use uuid::Uuid;

use crate::storage::{Result, StorageError};

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StorageError::InvalidRecord(format!("{value}: {e}")))
}
