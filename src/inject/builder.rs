//! Patch construction
//!
//! Turns (pod, previous injection status, rendered sidecar spec) into the
//! ordered JSON Patch sequence returned to the orchestrator. The order is
//! observable: JSON Patch applies sequentially, so removals come before
//! additions and each step assumes exactly the document state the previous
//! steps produced.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, SecurityContext, VolumeMount,
};
use serde_json::json;
use tracing::warn;

use super::mesh::MeshConfig;
use super::patch::{
    add_labels, add_object, add_op, add_to_array, remove_named, replace_op, update_annotations,
};
use super::probe::{
    dump_app_probers, probe_rewrite_patch, should_rewrite_app_http_probers, KUBE_APP_PROBERS_ENV,
};
use super::status::{SidecarInjectionStatus, INIT_CONTAINER_NAME, SIDECAR_CONTAINER_NAME};
use super::template::{find_sidecar, SidecarInjectionSpec};
use super::{InjectError, PROMETHEUS_MERGE_ANNOTATION};

/// Init container that validates the traffic redirection setup.
pub const VALIDATION_CONTAINER_NAME: &str = "istio-validation";

/// Env var on the sidecar capturing the pod's original scrape annotations.
pub const PROMETHEUS_SCRAPING_CONFIG_ENV: &str = "ISTIO_PROMETHEUS_ANNOTATIONS";

// Mesh labels stamped onto every injected pod.
pub const TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";
pub const MUTUAL_TLS_MODE: &str = "istio";
pub const CANONICAL_SERVICE_LABEL: &str = "service.istio.io/canonical-name";
pub const CANONICAL_REVISION_LABEL: &str = "service.istio.io/canonical-revision";
pub const REVISION_LABEL: &str = "istio.io/rev";
pub const NETWORK_LABEL: &str = "topology.istio.io/network";

const SA_JWT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Build the full injection patch.
///
/// Step order: probe env + probe rewrites, removals recorded by the previous
/// status (init containers, containers, volumes, image pull secrets),
/// prometheus merge capture/overwrite, additions from the rendered spec, DNS
/// config, security context re-assert, annotation updates, label additions.
#[allow(clippy::too_many_arguments)]
pub fn create_patch(
    pod: &Pod,
    prev_status: &SidecarInjectionStatus,
    revision: &str,
    annotations: &mut BTreeMap<String, String>,
    sic: &mut SidecarInjectionSpec,
    workload_name: &str,
    mesh: &MeshConfig,
) -> Result<Vec<u8>, InjectError> {
    let mut patch: Vec<PatchOperation> = Vec::new();

    let pod_annotations = pod.metadata.annotations.as_ref();
    let rewrite =
        should_rewrite_app_http_probers(pod_annotations, sic) && mesh.status_port() != 0;

    if rewrite {
        if let Some(prober) = dump_app_probers(pod)? {
            if let Some(sidecar) = find_sidecar(&mut sic.containers) {
                sidecar.env.get_or_insert_with(Vec::new).push(EnvVar {
                    name: KUBE_APP_PROBERS_ENV.to_string(),
                    value: Some(prober),
                    value_from: None,
                });
            }
        }
    }

    let empty_spec = PodSpec::default();
    let pod_spec = pod.spec.as_ref().unwrap_or(&empty_spec);

    if rewrite {
        patch.extend(probe_rewrite_patch(pod_spec, mesh.status_port())?);
    }

    // Remove whatever the previous injection added, by name. Names double as
    // the unique key for containers, volumes, and image pull secrets.
    let init_containers = pod_spec.init_containers.as_deref().unwrap_or(&[]);
    let containers = &pod_spec.containers;
    let volumes = pod_spec.volumes.as_deref().unwrap_or(&[]);
    let image_pull_secrets = pod_spec.image_pull_secrets.as_deref().unwrap_or(&[]);

    patch.extend(remove_named(
        init_containers,
        &prev_status.init_containers,
        "/spec/initContainers",
    ));
    patch.extend(remove_named(
        containers,
        &prev_status.containers,
        "/spec/containers",
    ));
    patch.extend(remove_named(volumes, &prev_status.volumes, "/spec/volumes"));
    patch.extend(remove_named(
        image_pull_secrets,
        &prev_status.image_pull_secrets,
        "/spec/imagePullSecrets",
    ));

    if enable_prometheus_merge(mesh, pod_annotations) {
        let scrape = scrape_configuration(pod_annotations);
        if let Some(scrape) = &scrape {
            if let Some(sidecar) = find_sidecar(&mut sic.containers) {
                sidecar.env.get_or_insert_with(Vec::new).push(EnvVar {
                    name: PROMETHEUS_SCRAPING_CONFIG_ENV.to_string(),
                    value: Some(serde_json::to_string(scrape)?),
                    value_from: None,
                });
            }
        }
        annotations.insert(
            "prometheus.io/port".to_string(),
            mesh.status_port().to_string(),
        );
        annotations.insert("prometheus.io/path".to_string(), "/stats/prometheus".to_string());
        annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
    }

    let hold_proxy_first = sic.hold_application_until_proxy_starts;
    let in_front = move |c: &Container| match c.name.as_str() {
        VALIDATION_CONTAINER_NAME => true,
        SIDECAR_CONTAINER_NAME => hold_proxy_first,
        _ => false,
    };
    patch.extend(add_to_array(
        init_containers.is_empty(),
        &with_sa_jwt_mount(init_containers, &sic.init_containers),
        "/spec/initContainers",
        in_front,
    )?);
    patch.extend(add_to_array(
        containers.is_empty(),
        &with_sa_jwt_mount(containers, &sic.containers),
        "/spec/containers",
        in_front,
    )?);
    patch.extend(add_to_array(
        volumes.is_empty(),
        &sic.volumes,
        "/spec/volumes",
        |_| false,
    )?);
    patch.extend(add_to_array(
        image_pull_secrets.is_empty(),
        &sic.image_pull_secrets,
        "/spec/imagePullSecrets",
        |_| false,
    )?);

    if let Some(dns_config) = &sic.dns_config {
        patch.push(add_object("/spec/dnsConfig", dns_config)?);
    }

    // Re-assert the pod security context whenever the pod carries one. Earlier
    // patch generations could clear it; emitting the add makes the post-state
    // explicit. Covered by a regression test; do not remove without evidence.
    if let Some(security_context) = &pod_spec.security_context {
        patch.push(add_object("/spec/securityContext", security_context)?);
    }

    patch.extend(update_annotations(pod_annotations, annotations));

    let pod_labels = pod.metadata.labels.as_ref();
    let (canonical_service, canonical_revision) =
        extract_canonical_service_labels(pod_labels, workload_name);
    let mut patch_labels = BTreeMap::from([
        (TLS_MODE_LABEL.to_string(), MUTUAL_TLS_MODE.to_string()),
        (CANONICAL_SERVICE_LABEL.to_string(), canonical_service),
        (REVISION_LABEL.to_string(), revision.to_string()),
        (CANONICAL_REVISION_LABEL.to_string(), canonical_revision),
    ]);
    if let Some(network) = topology_network(sic) {
        patch_labels.insert(NETWORK_LABEL.to_string(), network);
    }
    patch.extend(add_labels(pod_labels, &patch_labels));

    Ok(serde_json::to_vec(&patch)?)
}

/// Append the app's service-account token mount to the sidecar container so
/// the proxy can present the pod's identity token. The mount is taken from
/// whichever existing container carries it.
fn with_sa_jwt_mount(target: &[Container], added: &[Container]) -> Vec<Container> {
    let sa_mount: Option<VolumeMount> = target
        .iter()
        .flat_map(|c| c.volume_mounts.as_deref().unwrap_or(&[]))
        .filter(|m| m.mount_path == SA_JWT_MOUNT_PATH)
        .last()
        .cloned();
    let mut out = added.to_vec();
    if let Some(mount) = sa_mount {
        for container in &mut out {
            if container.name == SIDECAR_CONTAINER_NAME {
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(mount.clone());
            }
        }
    }
    out
}

/// The pod's own prometheus scrape annotations, or `None` when it has none.
fn scrape_configuration(
    annotations: Option<&BTreeMap<String, String>>,
) -> Option<BTreeMap<&'static str, String>> {
    let get = |key: &str| {
        annotations
            .and_then(|a| a.get(key))
            .cloned()
            .unwrap_or_default()
    };
    let scrape = get("prometheus.io/scrape");
    let path = get("prometheus.io/path");
    let port = get("prometheus.io/port");
    if scrape.is_empty() && path.is_empty() && port.is_empty() {
        return None;
    }
    Some(BTreeMap::from([
        ("scrape", scrape),
        ("path", path),
        ("port", port),
    ]))
}

/// Whether app metrics are merged with the sidecar's: per-pod annotation
/// first, then the mesh setting, defaulting to enabled.
pub fn enable_prometheus_merge(
    mesh: &MeshConfig,
    annotations: Option<&BTreeMap<String, String>>,
) -> bool {
    if let Some(value) = annotations.and_then(|a| a.get(PROMETHEUS_MERGE_ANNOTATION)) {
        match value.parse::<bool>() {
            Ok(merge) => return merge,
            Err(_) => warn!(
                annotation = PROMETHEUS_MERGE_ANNOTATION,
                value = %value,
                "invalid merge-metrics annotation"
            ),
        }
    }
    if let Some(merge) = mesh.enable_prometheus_merge {
        return merge;
    }
    true
}

/// Mesh-wide stable identifiers for the workload, derived from pod labels
/// with a documented fallback chain.
pub fn extract_canonical_service_labels(
    pod_labels: Option<&BTreeMap<String, String>>,
    workload_name: &str,
) -> (String, String) {
    let get = |key: &str| pod_labels.and_then(|l| l.get(key)).cloned();
    let service = get(CANONICAL_SERVICE_LABEL)
        .or_else(|| get("app.kubernetes.io/name"))
        .or_else(|| get("app"))
        .unwrap_or_else(|| workload_name.to_string());
    let revision = get(CANONICAL_REVISION_LABEL)
        .or_else(|| get("app.kubernetes.io/version"))
        .or_else(|| get("version"))
        .unwrap_or_else(|| "latest".to_string());
    (service, revision)
}

/// The network the sidecar reports itself in, read back from its rendered
/// `ISTIO_META_NETWORK` env var.
fn topology_network(sic: &SidecarInjectionSpec) -> Option<String> {
    for container in &sic.containers {
        for env in container.env.as_deref().unwrap_or(&[]) {
            if env.name == "ISTIO_META_NETWORK" {
                return env.value.clone().filter(|v| !v.is_empty());
            }
        }
    }
    None
}

/// Force the rendered sidecar to run as the resolved proxy UID: rewrite the
/// init container's `-u` argument and set `runAsUser` on the proxy container.
pub fn replace_proxy_run_as_user_id(spec: &mut SidecarInjectionSpec, proxy_uid: u64) {
    for container in &mut spec.init_containers {
        if container.name != INIT_CONTAINER_NAME {
            continue;
        }
        if let Some(args) = container.args.as_mut() {
            if let Some(position) = args.iter().position(|arg| arg == "-u") {
                if position + 1 < args.len() {
                    args[position + 1] = proxy_uid.to_string();
                }
            }
        }
        break;
    }
    for container in &mut spec.containers {
        if container.name != SIDECAR_CONTAINER_NAME {
            continue;
        }
        container
            .security_context
            .get_or_insert_with(SecurityContext::default)
            .run_as_user = Some(proxy_uid as i64);
        break;
    }
}

/// Build the reduced patch for a pod already injected out-of-band: adjust
/// the proxy UID in place and refresh annotations, leaving containers and
/// volumes untouched.
pub fn create_partial_patch(
    pod: &Pod,
    annotations: &BTreeMap<String, String>,
    proxy_uid: u64,
) -> Result<Vec<u8>, InjectError> {
    let mut patch = patch_proxy_run_as_user_id(pod, proxy_uid);
    patch.extend(update_annotations(
        pod.metadata.annotations.as_ref(),
        annotations,
    ));
    Ok(serde_json::to_vec(&patch)?)
}

/// Patch the proxy UID into an already-injected pod: replace the init
/// container's `-u` argument, and add or replace `runAsUser` on the sidecar
/// depending on what its security context currently holds.
fn patch_proxy_run_as_user_id(pod: &Pod, proxy_uid: u64) -> Vec<PatchOperation> {
    let mut patch = Vec::new();
    let Some(spec) = pod.spec.as_ref() else {
        return patch;
    };

    for (index, container) in spec.init_containers.as_deref().unwrap_or(&[]).iter().enumerate() {
        if container.name != INIT_CONTAINER_NAME {
            continue;
        }
        if let Some(args) = container.args.as_deref() {
            if let Some(position) = args.iter().position(|arg| arg == "-u") {
                // the uid is the argument following -u
                patch.push(replace_op(
                    format!("/spec/initContainers/{}/args/{}", index, position + 1),
                    json!(proxy_uid.to_string()),
                ));
            }
        }
        break;
    }

    for (index, container) in spec.containers.iter().enumerate() {
        if container.name != SIDECAR_CONTAINER_NAME {
            continue;
        }
        match container.security_context.as_ref() {
            None => patch.push(add_op(
                format!("/spec/containers/{index}/securityContext"),
                json!({ "runAsUser": proxy_uid }),
            )),
            Some(sc) if sc.run_as_user.is_none() => patch.push(add_op(
                format!("/spec/containers/{index}/securityContext/runAsUser"),
                json!(proxy_uid),
            )),
            Some(_) => patch.push(replace_op(
                format!("/spec/containers/{index}/securityContext/runAsUser"),
                json!(proxy_uid),
            )),
        }
        break;
    }

    patch
}

#[cfg(test)]
#[path = "builder_test.rs"]
mod tests;
