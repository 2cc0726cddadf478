//! Service catalog held in memory, optionally loaded from YAML.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::model::Service;
use crate::storage::{Result, ServiceRegistry, StorageError};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    services: Vec<Service>,
}

/// Service catalog keyed by service id.
#[derive(Default)]
pub struct MemoryServiceRegistry {
    services: RwLock<HashMap<String, Service>>,
}

impl MemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: impl IntoIterator<Item = Service>) -> Self {
        let services = services.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            services: RwLock::new(services),
        }
    }

    /// Parse a catalog document of the form `services: [...]`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let catalog: CatalogFile =
            serde_yaml::from_str(yaml).map_err(|e| StorageError::Catalog(e.to_string()))?;
        Ok(Self::with_services(catalog.services))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Catalog(format!("{}: {}", path.display(), e)))?;
        let registry = Self::from_yaml_str(&yaml)?;
        info!(path = %path.display(), "Loaded service catalog");
        Ok(registry)
    }

    pub async fn insert(&self, service: Service) {
        self.services
            .write()
            .await
            .insert(service.id.clone(), service);
    }
}

#[async_trait]
impl ServiceRegistry for MemoryServiceRegistry {
    async fn get_service(&self, id: &str) -> Result<Service> {
        self.services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("service", id))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<_> = self.services.read().await.values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
services:
  - id: meter
    name: Power meter
    image: registry.local/meter:1.2
    interfaces:
      - id: power
        name: Power readings
        auto_connect: true
        versions:
          - version_name: v1
            receives_hash: "00"
            sends_hash: "a1"
          - version_name: v2
            receives_hash: "00"
            sends_hash: "a2"
  - id: dashboard-gateway
    image: registry.local/gateway:3
"#;

    #[tokio::test]
    async fn test_catalog_from_yaml() {
        let registry = MemoryServiceRegistry::from_yaml_str(CATALOG).unwrap();
        let meter = registry.get_service("meter").await.unwrap();
        let power = meter.interface("power").unwrap();
        assert!(power.auto_connect);
        assert!(!power.allow_multiple);
        assert_eq!(power.versions.len(), 2);
        assert_eq!(power.version("v2").unwrap().sends_hash, "a2");

        let gateway = registry.get_service("dashboard-gateway").await.unwrap();
        assert!(gateway.interfaces.is_empty());
        assert_eq!(registry.list_services().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_service_not_found() {
        let registry = MemoryServiceRegistry::new();
        assert!(registry.get_service("nope").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_malformed_catalog_rejected() {
        let result = MemoryServiceRegistry::from_yaml_str("services: [{id: 1");
        assert!(matches!(result, Err(StorageError::Catalog(_))));
    }

    #[test]
    fn test_catalog_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, CATALOG).unwrap();
        assert!(MemoryServiceRegistry::from_yaml_file(&path).is_ok());
        assert!(MemoryServiceRegistry::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }
}
