//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod runtime;
mod storage;

pub use runtime::{
    ConnectionsConfig, ContainersConfig, QueueConfig, RegistryConfig, SessionConfig,
};
pub use storage::{StorageConfig, DEFAULT_SQLITE_PATH};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FLOTILLA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FLOTILLA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FLOTILLA_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Task queue workers.
    pub queue: QueueConfig,
    /// Management sessions.
    pub session: SessionConfig,
    /// Connection resolver.
    pub connections: ConnectionsConfig,
    /// Service catalog.
    pub registry: RegistryConfig,
    /// Container backend.
    pub containers: ContainersConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create config for testing: in-memory storage, fast polling, short timeouts.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.storage_type = "memory".to_string();
        config.queue.workers = 1;
        config.queue.poll_interval_ms = 10;
        config.session.io_timeout_ms = 500;
        config.session.connect_timeout_ms = 500;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.storage_type, "sqlite");
        assert_eq!(config.storage.path, DEFAULT_SQLITE_PATH);
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.queue.abandon_timeout_secs, 300);
        assert_eq!(config.session.management_port, 4999);
        assert_eq!(config.session.io_timeout_ms, 10_000);
        assert_eq!(config.connections.port_range_start, 5000);
        assert_eq!(config.connections.dashboard_gateway_service_id, "dashboard-gateway");
        assert!(config.registry.services_file.is_none());
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.storage.storage_type, "memory");
        assert_eq!(config.queue.workers, 1);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flotilla.yaml");
        std::fs::write(
            &path,
            "storage:\n  type: memory\nqueue:\n  workers: 2\nsession:\n  management_port: 6000\n",
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.storage.storage_type, "memory");
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.poll_interval_ms, 5000);
        assert_eq!(config.session.management_port, 6000);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(Config::load(Some("/nonexistent/flotilla.yaml")).is_err());
    }
}
