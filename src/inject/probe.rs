//! Application probe rewriting
//!
//! With mutual TLS the kubelet cannot probe the application directly, so the
//! injector rewrites HTTPGet readiness/liveness/startup probes to target the
//! sidecar's status port. The original probe definitions are handed to the
//! sidecar through an env var so it can proxy each probe back to the app.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{Container, HTTPGetAction, Pod, PodSpec, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::Value;
use tracing::warn;

use super::patch::replace_op;
use super::status::SIDECAR_CONTAINER_NAME;
use super::template::SidecarInjectionSpec;
use super::REWRITE_PROBERS_ANNOTATION;

/// Env var on the sidecar holding the JSON map of original app probes.
pub const KUBE_APP_PROBERS_ENV: &str = "ISTIO_KUBE_APP_PROBERS";

/// The probe kinds subject to rewriting, with the pod-spec field each lives
/// in and the status-path suffix it maps to.
fn probes_of(container: &Container) -> [(&'static str, &'static str, Option<&Probe>); 3] {
    [
        ("readinessProbe", "readyz", container.readiness_probe.as_ref()),
        ("livenessProbe", "livez", container.liveness_probe.as_ref()),
        ("startupProbe", "startupz", container.startup_probe.as_ref()),
    ]
}

fn status_path(container: &str, suffix: &str) -> String {
    format!("/app-health/{container}/{suffix}")
}

/// Whether probe rewriting is active for this pod: the per-pod annotation
/// wins when present and parseable, otherwise the rendered template decides.
pub fn should_rewrite_app_http_probers(
    annotations: Option<&BTreeMap<String, String>>,
    spec: &SidecarInjectionSpec,
) -> bool {
    if let Some(value) = annotations.and_then(|a| a.get(REWRITE_PROBERS_ANNOTATION)) {
        match value.parse::<bool>() {
            Ok(rewrite) => return rewrite,
            Err(_) => warn!(
                annotation = REWRITE_PROBERS_ANNOTATION,
                value = %value,
                "invalid probe rewrite annotation, falling back to template setting"
            ),
        }
    }
    spec.rewrite_app_http_probe
}

/// Collect every HTTPGet probe of the app containers into a JSON map keyed
/// by the status path the rewritten probe will use. Returns `None` when the
/// pod has no HTTPGet probes.
pub fn dump_app_probers(pod: &Pod) -> Result<Option<String>, serde_json::Error> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(None);
    };
    let mut probers: BTreeMap<String, Value> = BTreeMap::new();
    for container in &spec.containers {
        if container.name == SIDECAR_CONTAINER_NAME {
            continue;
        }
        for (_, suffix, probe) in probes_of(container) {
            let Some(probe) = probe else { continue };
            if probe.http_get.is_none() {
                continue;
            }
            probers.insert(
                status_path(&container.name, suffix),
                serde_json::to_value(probe)?,
            );
        }
    }
    if probers.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&probers)?))
}

/// Emit `replace` operations overwriting every HTTPGet app probe with one
/// that targets the sidecar status port at the path encoding the container
/// and probe kind. TCP and exec probes are left untouched.
pub fn probe_rewrite_patch(
    spec: &PodSpec,
    status_port: i32,
) -> Result<Vec<PatchOperation>, serde_json::Error> {
    let mut patch = Vec::new();
    for (index, container) in spec.containers.iter().enumerate() {
        if container.name == SIDECAR_CONTAINER_NAME {
            continue;
        }
        for (field, suffix, probe) in probes_of(container) {
            let Some(probe) = probe else { continue };
            if probe.http_get.is_none() {
                continue;
            }
            let mut rewritten = probe.clone();
            rewritten.http_get = Some(HTTPGetAction {
                path: Some(status_path(&container.name, suffix)),
                port: IntOrString::Int(status_port),
                ..Default::default()
            });
            patch.push(replace_op(
                format!("/spec/containers/{index}/{field}"),
                serde_json::to_value(&rewritten)?,
            ));
        }
    }
    Ok(patch)
}

#[cfg(test)]
#[path = "probe_test.rs"]
mod tests;
