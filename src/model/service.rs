//! Services, their interfaces and interface versions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One version of an interface contract.
///
/// `receives_hash` and `sends_hash` fingerprint the message types the
/// implementing process accepts and emits on a connection using this version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceVersion {
    pub version_name: String,
    pub receives_hash: String,
    pub sends_hash: String,
}

impl InterfaceVersion {
    pub fn new(
        version_name: impl Into<String>,
        receives_hash: impl Into<String>,
        sends_hash: impl Into<String>,
    ) -> Self {
        Self {
            version_name: version_name.into(),
            receives_hash: receives_hash.into(),
            sends_hash: sends_hash.into(),
        }
    }

    /// Two versions are compatible when each side receives what the other sends.
    pub fn is_compatible_with(&self, other: &InterfaceVersion) -> bool {
        self.receives_hash == other.sends_hash && self.sends_hash == other.receives_hash
    }
}

impl PartialOrd for InterfaceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Versions sort by name; later names are assumed newer.
impl Ord for InterfaceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version_name
            .cmp(&other.version_name)
            .then_with(|| self.receives_hash.cmp(&other.receives_hash))
            .then_with(|| self.sends_hash.cmp(&other.sends_hash))
    }
}

/// A named, versioned contract a service implements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub versions: Vec<InterfaceVersion>,
    /// Whether a process may hold more than one connection on this interface.
    #[serde(default)]
    pub allow_multiple: bool,
    /// Whether the orchestrator connects this interface automatically.
    #[serde(default)]
    pub auto_connect: bool,
}

impl Interface {
    /// True when any version of this interface is compatible with any version of `other`.
    pub fn is_compatible_with(&self, other: &Interface) -> bool {
        self.versions
            .iter()
            .any(|v| other.versions.iter().any(|o| v.is_compatible_with(o)))
    }

    pub fn version(&self, version_name: &str) -> Option<&InterfaceVersion> {
        self.versions.iter().find(|v| v.version_name == version_name)
    }
}

/// A deployable service image and the interfaces it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Full image reference handed to the container backend.
    pub image: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

impl Service {
    pub fn interface(&self, interface_id: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.id == interface_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_is_mirrored() {
        let a = InterfaceVersion::new("v1", "in", "out");
        let b = InterfaceVersion::new("v1", "out", "in");
        let c = InterfaceVersion::new("v1", "in", "out");
        assert!(a.is_compatible_with(&b));
        assert!(b.is_compatible_with(&a));
        assert!(!a.is_compatible_with(&c));
    }

    #[test]
    fn test_versions_sort_by_name() {
        let mut versions = vec![
            InterfaceVersion::new("v3", "a", "b"),
            InterfaceVersion::new("v1", "a", "b"),
            InterfaceVersion::new("v2", "a", "b"),
        ];
        versions.sort();
        let names: Vec<_> = versions.iter().map(|v| v.version_name.as_str()).collect();
        assert_eq!(names, ["v1", "v2", "v3"]);
    }
}
