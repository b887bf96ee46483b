//! Injection status annotation
//!
//! Every injected pod carries an annotation recording what the injection
//! added, so a later re-injection can cleanly remove the previous sidecar
//! before adding the current one.

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use super::STATUS_ANNOTATION;

// Deprecated hardcoded container and volume names, retained so pods injected
// by an older generation of the tooling are still cleaned up on re-injection.
pub const INIT_CONTAINER_NAME: &str = "istio-init";
pub const SIDECAR_CONTAINER_NAME: &str = "istio-proxy";

const LEGACY_INIT_CONTAINER_NAMES: [&str; 2] = [INIT_CONTAINER_NAME, "enable-core-dump"];
const LEGACY_CONTAINER_NAMES: [&str; 1] = [SIDECAR_CONTAINER_NAME];
const LEGACY_VOLUME_NAMES: [&str; 2] = ["istio-certs", "istio-envoy"];

/// Record of what a prior injection added to a pod. Stored JSON-encoded under
/// the status annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarInjectionStatus {
    /// Template version hash the injection was rendered from.
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

impl SidecarInjectionStatus {
    fn is_empty(&self) -> bool {
        self.init_containers.is_empty()
            && self.containers.is_empty()
            && self.volumes.is_empty()
            && self.image_pull_secrets.is_empty()
    }
}

/// Status inferred for a pod injected by an older tool that did not write the
/// status annotation.
fn legacy_status() -> SidecarInjectionStatus {
    SidecarInjectionStatus {
        version: String::new(),
        init_containers: LEGACY_INIT_CONTAINER_NAMES
            .iter()
            .map(|s| s.to_string())
            .collect(),
        containers: LEGACY_CONTAINER_NAMES.iter().map(|s| s.to_string()).collect(),
        volumes: LEGACY_VOLUME_NAMES.iter().map(|s| s.to_string()).collect(),
        image_pull_secrets: Vec::new(),
    }
}

/// Read the previous injection status from a pod.
///
/// The annotation value is trusted when it decodes and names at least one
/// resource. Anything else falls back to the legacy hardcoded names so an
/// older-generation injected pod is properly cleaned up before re-injection.
pub fn injection_status(pod: &Pod) -> SidecarInjectionStatus {
    if let Some(value) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(STATUS_ANNOTATION))
    {
        if let Ok(status) = serde_json::from_str::<SidecarInjectionStatus>(value) {
            if !status.is_empty() {
                return status;
            }
        }
    }
    legacy_status()
}

#[cfg(test)]
#[path = "status_test.rs"]
mod tests;
