//! Sidecar injection pipeline
//!
//! Everything between a decoded admission request and the JSON Patch bytes
//! of the response: the injection decision, proxy UID resolution, template
//! rendering seam, and patch construction.

pub mod builder;
pub mod config;
pub mod decision;
pub mod mesh;
pub mod patch;
pub mod probe;
pub mod status;
pub mod template;
pub mod uid;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodSecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;

use self::builder::{create_partial_patch, create_patch, replace_proxy_run_as_user_id};
use self::mesh::MeshConfig;
use self::status::injection_status;
use self::template::SidecarRenderer;
use self::uid::DEFAULT_SIDECAR_PROXY_UID;

// Annotations the injector reads and writes.
pub const INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";
pub const STATUS_ANNOTATION: &str = "sidecar.istio.io/status";
pub const PROXY_UID_ANNOTATION: &str = "sidecar.istio.io/proxyUID";
pub const REWRITE_PROBERS_ANNOTATION: &str = "sidecar.istio.io/rewriteAppHTTPProbers";
pub const PROMETHEUS_MERGE_ANNOTATION: &str = "prometheus.istio.io/merge-metrics";

/// Errors raised while building an injection patch. All of them surface as
/// the admission result message; the orchestrator retries pod admission.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to parse sidecar template: {0}")]
    Template(#[from] serde_yaml::Error),

    #[error("failed to serialize patch: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Group/version/kind of the workload that owns the admitted pod.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMeta {
    pub api_version: String,
    pub kind: String,
}

/// Name and namespace of the workload that owns the admitted pod.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployMeta {
    pub name: String,
    pub namespace: String,
}

/// Everything one admission request needs to build its patch. Assembled by
/// the webhook from the request and a snapshot of the shared configuration;
/// lives for the duration of that request.
#[derive(Debug, Clone)]
pub struct InjectionParameters {
    pub deploy_meta: DeployMeta,
    pub type_meta: TypeMeta,
    pub template: String,
    pub version: String,
    pub mesh_config: MeshConfig,
    pub values_config: String,
    pub revision: String,
    pub proxy_envs: BTreeMap<String, String>,
    pub injected_annotations: BTreeMap<String, String>,
    pub proxy_uid: u64,
    pub proxy_gid: Option<i64>,
}

/// Whether the legacy FSGroup workaround is active. The service-account
/// token file is only readable by its fsGroup, so the pod-level fsGroup is
/// forced to the proxy GID before patch construction.
pub fn enable_legacy_fsgroup_injection() -> bool {
    std::env::var("ENABLE_LEGACY_FSGROUP_INJECTION")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true)
}

/// Render the template and build the patch bytes for one pod.
///
/// `partial` selects the reduced path for pods that were already injected
/// out-of-band: only the proxy UID and annotations are adjusted.
pub fn inject_pod(
    renderer: &dyn SidecarRenderer,
    params: &InjectionParameters,
    pod: &mut Pod,
    partial: bool,
) -> Result<Vec<u8>, InjectError> {
    if enable_legacy_fsgroup_injection() {
        let group = params.proxy_gid.unwrap_or(DEFAULT_SIDECAR_PROXY_UID as i64);
        let spec = pod.spec.get_or_insert_with(Default::default);
        spec.security_context
            .get_or_insert_with(PodSecurityContext::default)
            .fs_group = Some(group);
    }

    let (mut spec, istatus) = renderer.injection_data(params, pod)?;

    let mut annotations = BTreeMap::new();
    annotations.insert(STATUS_ANNOTATION.to_string(), istatus);
    annotations.extend(params.injected_annotations.clone());

    if partial {
        create_partial_patch(pod, &params.injected_annotations, params.proxy_uid)
    } else {
        replace_proxy_run_as_user_id(&mut spec, params.proxy_uid);
        create_patch(
            pod,
            &injection_status(pod),
            &params.revision,
            &mut annotations,
            &mut spec,
            &params.deploy_meta.name,
            &params.mesh_config,
        )
    }
}

/// Name for a pod that may not have one yet: generated pods only carry
/// `generateName` at admission time.
pub fn potential_pod_name(metadata: &ObjectMeta) -> String {
    if let Some(name) = metadata.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    if let Some(generate_name) = metadata.generate_name.as_deref().filter(|n| !n.is_empty()) {
        return format!("{generate_name}***** (actual name not yet known)");
    }
    String::new()
}

/// Resolve the workload that owns a pod from its controlling owner
/// reference. A ReplicaSet owner whose name ends in the pod-template-hash is
/// reported as its Deployment.
pub fn deploy_meta_from_pod(pod: &Pod) -> (DeployMeta, TypeMeta) {
    let metadata = &pod.metadata;
    let mut deploy_meta = DeployMeta {
        name: String::new(),
        namespace: metadata.namespace.clone().unwrap_or_default(),
    };
    let mut type_meta = TypeMeta {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
    };

    let generated = metadata
        .generate_name
        .as_deref()
        .map(|n| !n.is_empty())
        .unwrap_or(false);
    if generated {
        let controller = metadata
            .owner_references
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .find(|r| r.controller.unwrap_or(false));
        if let Some(controller) = controller {
            type_meta.api_version = controller.api_version.clone();
            type_meta.kind = controller.kind.clone();
            let template_hash = metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("pod-template-hash"))
                .cloned()
                .unwrap_or_default();
            if type_meta.kind == "ReplicaSet"
                && !template_hash.is_empty()
                && controller.name.ends_with(&template_hash)
            {
                deploy_meta.name = controller
                    .name
                    .strip_suffix(&format!("-{template_hash}"))
                    .unwrap_or(&controller.name)
                    .to_string();
                type_meta.kind = "Deployment".to_string();
            } else {
                deploy_meta.name = controller.name.clone();
            }
        }
    }

    if deploy_meta.name.is_empty() {
        // The diagnostic name from potential_pod_name is log-only; the
        // workload name feeds the canonical-service label and must stay a
        // valid label value.
        deploy_meta.name = metadata.name.clone().unwrap_or_default();
    }

    (deploy_meta, type_meta)
}

#[cfg(test)]
#[path = "inject_test.rs"]
mod tests;
