//! Storage configuration types.

use serde::Deserialize;

/// Default SQLite database location.
pub const DEFAULT_SQLITE_PATH: &str = "./data/flotilla.db";

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: `sqlite` or `memory`.
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Database file for the SQLite backend.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: DEFAULT_SQLITE_PATH.to_string(),
        }
    }
}
