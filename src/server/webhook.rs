//! Mutating admission webhook for sidecar injection
//!
//! Kubernetes POSTs an AdmissionReview to /inject when a pod is about to be
//! created. The handler decides whether the pod joins the mesh and answers
//! with a JSON Patch. Extra env vars for the sidecar can be passed in the
//! URL path: `/inject/k1/v1/k2/v2/...`.
//!
//! ## Endpoints
//! - POST /inject - plain injection
//! - POST /inject/<kv-pairs> - injection with URL env overrides
//!
//! Both `admission.k8s.io/v1` and `v1beta1` review envelopes are accepted;
//! the response mirrors the request's apiVersion and echoes its UID.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::inject::config::{template_version_hash, Config};
use crate::inject::decision::{
    inject_required, was_injected_through_istioctl, IGNORED_NAMESPACES,
};
use crate::inject::mesh::MeshConfig;
use crate::inject::template::SidecarRenderer;
use crate::inject::uid::resolve_proxy_ids;
use crate::inject::{
    deploy_meta_from_pod, inject_pod, potential_pod_name, InjectionParameters,
};
use crate::server::metrics::SharedMetrics;

/// Kubernetes AdmissionReview request envelope. The same shape covers both
/// supported apiVersions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// The admission request wrapped by the review envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    /// The pod about to be created, as raw JSON.
    #[serde(default)]
    pub object: Value,
}

/// Status carried by an errored admission response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionResult {
    pub message: String,
}

/// The webhook's verdict plus the patch to apply.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AdmissionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<ByteString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

/// Response envelope, mirroring the request's apiVersion and kind.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

fn to_admission_response(message: impl Into<String>) -> AdmissionResponse {
    AdmissionResponse {
        result: Some(AdmissionResult {
            message: message.into(),
        }),
        ..Default::default()
    }
}

/// Configuration snapshot shared by all request handlers and replaced
/// wholesale by the watcher.
#[derive(Clone)]
struct ActiveConfig {
    config: Config,
    values: String,
    template_version: String,
    mesh: MeshConfig,
}

/// Parameters for building the injection webhook.
pub struct WebhookParameters {
    /// Initial injector config, typically from `FileWatcher::get`.
    pub config: Config,
    /// Initial values file content.
    pub values_config: String,
    /// Mesh configuration snapshot.
    pub mesh_config: MeshConfig,
    /// Template renderer collaborator.
    pub renderer: Arc<dyn SidecarRenderer>,
    /// The mesh revision this injector is responsible for.
    pub revision: String,
    /// Injection counters.
    pub metrics: SharedMetrics,
}

/// The mutating webhook for automatic sidecar injection.
pub struct Webhook {
    shared: RwLock<ActiveConfig>,
    renderer: Arc<dyn SidecarRenderer>,
    revision: String,
    metrics: SharedMetrics,
}

impl Webhook {
    /// Create a new webhook. Wire `update_config` into the watcher handler
    /// so reloads swap the active configuration.
    pub fn new(params: WebhookParameters) -> Arc<Webhook> {
        let template_version = template_version_hash(&params.config.template);
        Arc::new(Webhook {
            shared: RwLock::new(ActiveConfig {
                config: params.config,
                values: params.values_config,
                template_version,
                mesh: params.mesh_config,
            }),
            renderer: params.renderer,
            revision: params.revision,
            metrics: params.metrics,
        })
    }

    /// Atomically swap the active (config, values, template version) triple.
    /// A request sees either the full old triple or the full new one.
    pub fn update_config(&self, config: Config, values_config: String) {
        let version = template_version_hash(&config.template);
        let mut shared = self.shared.write().expect("config lock poisoned");
        shared.config = config;
        shared.values = values_config;
        shared.template_version = version;
    }

    /// Swap the active mesh config snapshot.
    pub fn update_mesh_config(&self, mesh_config: MeshConfig) {
        let mut shared = self.shared.write().expect("config lock poisoned");
        shared.mesh = mesh_config;
    }

    fn snapshot(&self) -> ActiveConfig {
        self.shared.read().expect("config lock poisoned").clone()
    }

    fn handle_error(&self, message: &str) {
        error!("{message}");
        self.metrics.failed.inc();
    }

    /// Process one decoded admission review. `path` is the request URL path,
    /// carrying the optional env overrides.
    pub fn inject(&self, review: &AdmissionReview, path: &str) -> AdmissionResponse {
        let Some(request) = review.request.as_ref() else {
            self.handle_error("admission review carries no request");
            return to_admission_response("admission review carries no request");
        };

        let mut pod: Pod = match serde_json::from_value(request.object.clone()) {
            Ok(pod) => pod,
            Err(e) => {
                self.handle_error(&format!("could not unmarshal raw pod object: {e}"));
                return to_admission_response(e.to_string());
            }
        };

        // Pods created through a controller have empty name and namespace at
        // admission time.
        let pod_name = potential_pod_name(&pod.metadata);
        if pod.metadata.namespace.as_deref().unwrap_or("").is_empty() {
            pod.metadata.namespace = Some(request.namespace.clone());
        }
        info!(namespace = %request.namespace, pod = %pod_name, "sidecar injection request");

        let snapshot = self.snapshot();

        let mut partial_injection = false;
        if !inject_required(&IGNORED_NAMESPACES, &snapshot.config, &pod) {
            if was_injected_through_istioctl(&pod) {
                info!(
                    namespace = %request.namespace,
                    pod = %pod_name,
                    "performing partial injection into pre-injected pod"
                );
                partial_injection = true;
            } else {
                info!(namespace = %request.namespace, pod = %pod_name, "skipping due to policy check");
                self.metrics.skipped.inc();
                return AdmissionResponse {
                    uid: request.uid.clone(),
                    allowed: true,
                    ..Default::default()
                };
            }
        }

        let (proxy_uid, proxy_gid) = resolve_proxy_ids(&pod);
        let (deploy_meta, type_meta) = deploy_meta_from_pod(&pod);
        let params = InjectionParameters {
            deploy_meta,
            type_meta,
            template: snapshot.config.template.clone(),
            version: snapshot.template_version,
            mesh_config: snapshot.mesh,
            values_config: snapshot.values,
            revision: self.revision.clone(),
            proxy_envs: parse_inject_envs(path),
            injected_annotations: snapshot.config.injected_annotations.clone(),
            proxy_uid,
            proxy_gid: Some(proxy_gid),
        };

        match inject_pod(self.renderer.as_ref(), &params, &mut pod, partial_injection) {
            Ok(patch) => {
                debug!(patch = %String::from_utf8_lossy(&patch), "admission patch");
                self.metrics.successful.inc();
                AdmissionResponse {
                    uid: request.uid.clone(),
                    allowed: true,
                    result: None,
                    patch: Some(ByteString(patch)),
                    patch_type: Some("JSONPatch".to_string()),
                }
            }
            Err(e) => {
                self.handle_error(&format!("pod injection failed: {e}"));
                AdmissionResponse {
                    uid: request.uid.clone(),
                    ..to_admission_response(e.to_string())
                }
            }
        }
    }
}

/// Axum handler for POST /inject and /inject/<kv-pairs>.
pub async fn handle_inject(
    State(webhook): State<Arc<Webhook>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    webhook.metrics.total.inc();

    if body.is_empty() {
        webhook.handle_error("no body found");
        return (StatusCode::BAD_REQUEST, "no body found").into_response();
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != "application/json" {
        webhook.handle_error(&format!(
            "contentType={content_type}, expect application/json"
        ));
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid Content-Type, want `application/json`",
        )
            .into_response();
    }

    let path = uri.path();
    let (api_version, kind, response) = match serde_json::from_slice::<AdmissionReview>(&body) {
        Ok(review) => {
            let response = webhook.inject(&review, path);
            (review.api_version, review.kind, response)
        }
        Err(e) => {
            webhook.handle_error(&format!("could not decode body: {e}"));
            (String::new(), String::new(), to_admission_response(e.to_string()))
        }
    };

    let review_response = AdmissionReviewResponse {
        api_version,
        kind,
        response,
    };
    match serde_json::to_vec(&review_response) {
        Ok(bytes) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "could not encode admission response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("could not encode response: {e}"),
            )
                .into_response()
        }
    }
}

/// Canonical env-var name for a known URL parameter key.
fn url_parameter_to_env(key: &str) -> Option<&'static str> {
    match key {
        "cluster" => Some("ISTIO_META_CLUSTER_ID"),
        "net" => Some("ISTIO_META_NETWORK"),
        _ => None,
    }
}

/// Parse extra sidecar env vars from the inject URL path.
///
/// Format is `/inject/k1/v1/k2/v2` in any key order. Known keys map to their
/// canonical env names; unknown keys are upper-cased as-is. An odd-count
/// tail drops its final key with a warning.
pub fn parse_inject_envs(path: &str) -> BTreeMap<String, String> {
    let path = path.strip_suffix('/').unwrap_or(path);
    let parts: Vec<&str> = path.split('/').collect();
    let mut envs = BTreeMap::new();

    // parts[0] is empty and parts[1] is "inject"
    let mut i = 2;
    while i < parts.len() {
        let key = parts[i];
        if i == parts.len() - 1 {
            warn!(key = %key, "odd number of inject env entries, ignoring the last key");
            break;
        }
        let env = match url_parameter_to_env(key) {
            Some(env) => env.to_string(),
            None => key.to_uppercase(),
        };
        if !env.is_empty() {
            envs.insert(env, parts[i + 1].to_string());
        }
        i += 2;
    }

    envs
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod tests;
