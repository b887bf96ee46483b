//! Mesh configuration snapshot
//!
//! Only the fields the injector consumes are modeled; the rest of the mesh
//! config belongs to the surrounding control plane.

use serde::Deserialize;

/// Subset of the mesh-wide proxy defaults relevant to injection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyDefaults {
    /// Port of the sidecar status server. Application probes are rewritten to
    /// target this port; zero disables probe rewriting entirely.
    pub status_port: i32,
}

/// Mesh configuration snapshot shared by all admission requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    /// Mesh-wide proxy defaults.
    pub default_config: ProxyDefaults,

    /// Whether application metrics are merged with the sidecar's on the
    /// status port. Unset means enabled.
    pub enable_prometheus_merge: Option<bool>,
}

impl MeshConfig {
    /// Parse a mesh config document from YAML.
    pub fn from_yaml(data: &str) -> Result<MeshConfig, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }

    /// Status port of the sidecar, or zero when unset.
    pub fn status_port(&self) -> i32 {
        self.default_config.status_port
    }
}
