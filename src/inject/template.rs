//! Rendered sidecar specification and the renderer seam
//!
//! Template rendering is a collaborator: the injector only depends on the
//! [`SidecarRenderer`] trait, which turns the active template plus the
//! per-request parameters into a [`SidecarInjectionSpec`] and the status
//! string recorded on the pod. The built-in [`YamlRenderer`] parses the
//! template text as plain YAML; richer templating engines plug in behind the
//! same trait.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, Pod, PodDNSConfig, Volume,
};
use serde::Deserialize;

use super::status::{SidecarInjectionStatus, SIDECAR_CONTAINER_NAME};
use super::{InjectError, InjectionParameters};

/// What the template renderer wants added to a pod. Mirrors the pod fields
/// the patch builder touches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarInjectionSpec {
    /// Rewrite application HTTP probes to go through the sidecar status port.
    /// A per-pod annotation overrides this template default.
    pub rewrite_app_http_probe: bool,
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    pub dns_config: Option<PodDNSConfig>,
    pub image_pull_secrets: Vec<LocalObjectReference>,
    /// Insert the proxy container in front of the app containers so the
    /// kubelet starts it first.
    pub hold_application_until_proxy_starts: bool,
}

/// Find the sidecar proxy container within a rendered container list.
pub fn find_sidecar(containers: &mut [Container]) -> Option<&mut Container> {
    containers
        .iter_mut()
        .find(|c| c.name == SIDECAR_CONTAINER_NAME)
}

/// Renders the active sidecar template for one admission request.
///
/// Pure function of its inputs: the same parameters and pod must produce the
/// same spec and status string.
pub trait SidecarRenderer: Send + Sync {
    fn injection_data(
        &self,
        params: &InjectionParameters,
        pod: &Pod,
    ) -> Result<(SidecarInjectionSpec, String), InjectError>;
}

/// Renderer for templates that are already concrete YAML.
///
/// Parses the template into a [`SidecarInjectionSpec`], then appends the
/// URL-derived env overrides to the sidecar container.
#[derive(Debug, Default)]
pub struct YamlRenderer;

impl SidecarRenderer for YamlRenderer {
    fn injection_data(
        &self,
        params: &InjectionParameters,
        _pod: &Pod,
    ) -> Result<(SidecarInjectionSpec, String), InjectError> {
        let mut spec: SidecarInjectionSpec = serde_yaml::from_str(&params.template)?;

        if !params.proxy_envs.is_empty() {
            if let Some(sidecar) = find_sidecar(&mut spec.containers) {
                let env = sidecar.env.get_or_insert_with(Vec::new);
                for (name, value) in &params.proxy_envs {
                    env.push(EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        value_from: None,
                    });
                }
            }
        }

        let status = injection_status_string(&spec, &params.version)?;
        Ok((spec, status))
    }
}

/// Build the JSON status string recorded under the status annotation: the
/// names of everything the spec adds, plus the template version it was
/// rendered from.
pub fn injection_status_string(
    spec: &SidecarInjectionSpec,
    version: &str,
) -> Result<String, InjectError> {
    let status = SidecarInjectionStatus {
        version: version.to_string(),
        init_containers: spec.init_containers.iter().map(|c| c.name.clone()).collect(),
        containers: spec.containers.iter().map(|c| c.name.clone()).collect(),
        volumes: spec.volumes.iter().map(|v| v.name.clone()).collect(),
        image_pull_secrets: spec
            .image_pull_secrets
            .iter()
            .map(|s| s.name.clone())
            .collect(),
    };
    Ok(serde_json::to_string(&status)?)
}

#[cfg(test)]
#[path = "template_test.rs"]
mod tests;
