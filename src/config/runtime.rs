//! Runtime tuning for the queue, sessions, connections and containers.

use std::time::Duration;

use serde::Deserialize;

/// Task queue worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Idle sleep between lease attempts when nothing is eligible.
    pub poll_interval_ms: u64,
    /// Age after which a lease counts as abandoned by a crashed worker.
    pub abandon_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 5000,
            abandon_timeout_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn abandon_timeout(&self) -> Duration {
        Duration::from_secs(self.abandon_timeout_secs)
    }
}

/// Management session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Port every process exposes its management protocol on.
    pub management_port: u16,
    /// Bound on each write and each reply read.
    pub io_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Frames above this size are rejected as malformed.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            management_port: 4999,
            io_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Connection resolver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Service whose processes may connect across users.
    pub dashboard_gateway_service_id: String,
    /// First port handed out for connection listeners.
    pub port_range_start: u16,
    pub port_range_size: u16,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            dashboard_gateway_service_id: "dashboard-gateway".to_string(),
            port_range_start: 5000,
            port_range_size: 5000,
        }
    }
}

/// Service catalog source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// YAML file listing services, their interfaces and versions.
    pub services_file: Option<String>,
}

/// Container backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainersConfig {
    pub docker_binary: String,
    /// Per-user network name prefix; the user id is appended.
    pub network_prefix: String,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            network_prefix: "flotilla-user-".to_string(),
        }
    }
}
