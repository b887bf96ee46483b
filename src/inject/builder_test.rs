//! Tests for patch construction

use super::*;
use crate::inject::status::injection_status;
use crate::inject::template::YamlRenderer;
use crate::inject::{
    inject_pod, DeployMeta, InjectionParameters, TypeMeta, PROXY_UID_ANNOTATION,
    REWRITE_PROBERS_ANNOTATION, STATUS_ANNOTATION,
};
use serde_json::Value;

const TEMPLATE: &str = r#"
initContainers:
- name: istio-init
  image: init:1.0
  args: ["-p", "15001", "-u", "1337"]
containers:
- name: istio-proxy
  image: proxy:1.0
volumes:
- name: istio-envoy
  emptyDir: {}
"#;

fn pod(value: Value) -> Pod {
    serde_json::from_value(value).unwrap()
}

fn spec_from_yaml(template: &str) -> SidecarInjectionSpec {
    serde_yaml::from_str(template).unwrap()
}

fn mesh(status_port: i32, merge: bool) -> MeshConfig {
    serde_yaml::from_str(&format!(
        "defaultConfig:\n  statusPort: {status_port}\nenablePrometheusMerge: {merge}\n"
    ))
    .unwrap()
}

fn status_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(STATUS_ANNOTATION.to_string(), "{}".to_string())])
}

/// The emitted operations in their RFC 6902 wire form
fn ops(bytes: &[u8]) -> Vec<Value> {
    serde_json::from_slice(bytes).unwrap()
}

/// Apply emitted patch bytes to a document with the json_patch engine
fn apply(doc: &mut Value, bytes: &[u8]) {
    let patch: json_patch::Patch = serde_json::from_slice(bytes).unwrap();
    json_patch::patch(doc, &patch).unwrap();
}

fn params(template: &str, mesh_config: MeshConfig) -> InjectionParameters {
    InjectionParameters {
        deploy_meta: DeployMeta {
            name: "workload".to_string(),
            namespace: "apps".to_string(),
        },
        type_meta: TypeMeta {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
        },
        template: template.to_string(),
        version: "testversion".to_string(),
        mesh_config,
        values_config: String::new(),
        revision: "default".to_string(),
        proxy_envs: BTreeMap::new(),
        injected_annotations: BTreeMap::new(),
        proxy_uid: 1337,
        proxy_gid: Some(1337),
    }
}

/// Test: first injection into a pod with no previous status emits only adds
#[test]
fn test_first_injection_empty_pod() {
    let pod = pod(serde_json::json!({
        "metadata": {"namespace": "ns"},
        "spec": {"containers": [{"name": "app", "image": "x"}]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    assert!(patch.iter().all(|op| op["op"] != "remove"));
    // empty initContainers array is created with a one-element list
    assert_eq!(patch[0]["op"], "add");
    assert_eq!(patch[0]["path"], "/spec/initContainers");
    assert_eq!(patch[0]["value"][0]["name"], "istio-init");
    // the proxy appends to the existing containers array
    assert_eq!(patch[1]["path"], "/spec/containers/-");
    assert_eq!(patch[1]["value"]["name"], "istio-proxy");
    // labels are created as a map on this label-less pod
    assert!(patch.iter().any(|op| op["path"] == "/metadata/labels"));
}

/// Test: re-injection removes everything the previous status names, highest
/// index first within each array, before adding
#[test]
fn test_reinjection_removes_previous() {
    let status = r#"{"initContainers":["istio-init"],"containers":["istio-proxy"],"volumes":["istio-certs","istio-envoy"]}"#;
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "annotations": {STATUS_ANNOTATION: status}
        },
        "spec": {
            "initContainers": [{"name": "istio-init"}],
            "containers": [{"name": "app"}, {"name": "istio-proxy"}],
            "volumes": [{"name": "istio-certs"}, {"name": "istio-envoy"}]
        }
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    let removes: Vec<&str> = patch
        .iter()
        .take_while(|op| op["op"] == "remove")
        .map(|op| op["path"].as_str().unwrap())
        .collect();
    assert_eq!(
        removes,
        vec![
            "/spec/initContainers/0",
            "/spec/containers/1",
            "/spec/volumes/1",
            "/spec/volumes/0"
        ]
    );
    // additions follow the removals
    assert_eq!(patch[removes.len()]["op"], "add");
}

/// Test: probe rewrite replaces the app probe and records the original on
/// the sidecar env
#[test]
fn test_probe_rewrite() {
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "annotations": {REWRITE_PROBERS_ANNOTATION: "true"}
        },
        "spec": {"containers": [{
            "name": "app",
            "readinessProbe": {"httpGet": {"path": "/healthz", "port": 8080}}
        }]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    // the probe replace comes before any addition
    assert_eq!(patch[0]["op"], "replace");
    assert_eq!(patch[0]["path"], "/spec/containers/0/readinessProbe");
    assert_eq!(patch[0]["value"]["httpGet"]["path"], "/app-health/app/readyz");
    assert_eq!(patch[0]["value"]["httpGet"]["port"], 15020);

    // the sidecar add carries the probers env var
    let sidecar_add = patch
        .iter()
        .find(|op| op["path"] == "/spec/containers/-")
        .unwrap();
    let env = &sidecar_add["value"]["env"];
    assert_eq!(env[0]["name"], "ISTIO_KUBE_APP_PROBERS");
    let probers: Value = serde_json::from_str(env[0]["value"].as_str().unwrap()).unwrap();
    assert_eq!(probers["/app-health/app/readyz"]["httpGet"]["path"], "/healthz");
}

/// Test: a status port of zero disables probe rewriting even when opted in
#[test]
fn test_probe_rewrite_disabled_without_status_port() {
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "annotations": {REWRITE_PROBERS_ANNOTATION: "true"}
        },
        "spec": {"containers": [{
            "name": "app",
            "readinessProbe": {"httpGet": {"path": "/healthz", "port": 8080}}
        }]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(0, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    assert!(patch.iter().all(|op| op["op"] != "replace"));
    let sidecar_add = patch
        .iter()
        .find(|op| op["path"] == "/spec/containers/-")
        .unwrap();
    assert!(sidecar_add["value"].get("env").is_none());
}

/// Test: partial injection is limited to runAsUser adjustments and
/// annotation updates
#[test]
fn test_partial_injection() {
    let pod = pod(serde_json::json!({
        "metadata": {"namespace": "ns", "annotations": {STATUS_ANNOTATION: "{}"}},
        "spec": {
            "initContainers": [{
                "name": "istio-init",
                "args": ["-p", "15001", "-u", "1337"]
            }],
            "containers": [
                {"name": "app"},
                {"name": "istio-proxy", "securityContext": {"runAsUser": 1337}}
            ]
        }
    }));

    let bytes = create_partial_patch(&pod, &BTreeMap::new(), 2001).unwrap();
    let patch = ops(&bytes);

    assert_eq!(patch.len(), 2);
    assert_eq!(patch[0]["op"], "replace");
    assert_eq!(patch[0]["path"], "/spec/initContainers/0/args/3");
    assert_eq!(patch[0]["value"], "2001");
    assert_eq!(patch[1]["op"], "replace");
    assert_eq!(patch[1]["path"], "/spec/containers/1/securityContext/runAsUser");
    assert_eq!(patch[1]["value"], 2001);
}

/// Test: partial injection adds the security context when the sidecar has
/// none, and adds runAsUser when the context exists without it
#[test]
fn test_partial_injection_security_context_variants() {
    let no_context = pod(serde_json::json!({
        "spec": {"containers": [{"name": "istio-proxy"}]}
    }));
    let bytes = create_partial_patch(&no_context, &BTreeMap::new(), 1337).unwrap();
    let patch = ops(&bytes);
    assert_eq!(patch[0]["op"], "add");
    assert_eq!(patch[0]["path"], "/spec/containers/0/securityContext");
    assert_eq!(patch[0]["value"], serde_json::json!({"runAsUser": 1337}));

    let no_run_as = pod(serde_json::json!({
        "spec": {"containers": [{
            "name": "istio-proxy",
            "securityContext": {"readOnlyRootFilesystem": true}
        }]}
    }));
    let bytes = create_partial_patch(&no_run_as, &BTreeMap::new(), 1337).unwrap();
    let patch = ops(&bytes);
    assert_eq!(patch[0]["op"], "add");
    assert_eq!(patch[0]["path"], "/spec/containers/0/securityContext/runAsUser");
}

/// Test: full pipeline run twice is equivalent to running it once
#[test]
fn test_idempotent_reinjection() {
    let original = pod(serde_json::json!({
        "metadata": {
            "name": "p",
            "namespace": "apps",
            "annotations": {PROXY_UID_ANNOTATION: "1337"}
        },
        "spec": {"containers": [{"name": "app", "image": "x"}]}
    }));
    let params = params(TEMPLATE, mesh(15020, false));

    // first pass over the raw pod
    let mut first = original.clone();
    let bytes = inject_pod(&YamlRenderer, &params, &mut first, false).unwrap();
    let mut once = serde_json::to_value(&original).unwrap();
    apply(&mut once, &bytes);

    // second pass over the already-patched pod
    let reinjected: Pod = serde_json::from_value(once.clone()).unwrap();
    let mut second = reinjected.clone();
    let bytes = inject_pod(&YamlRenderer, &params, &mut second, false).unwrap();
    let mut twice = once.clone();
    apply(&mut twice, &bytes);

    assert_eq!(once, twice);

    // post-image sanity: templated resources present exactly once
    let containers = twice["spec"]["containers"].as_array().unwrap();
    let proxies: Vec<_> = containers
        .iter()
        .filter(|c| c["name"] == "istio-proxy")
        .collect();
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0]["securityContext"]["runAsUser"], 1337);
    assert_eq!(
        twice["spec"]["initContainers"].as_array().unwrap().len(),
        1
    );
}

/// Test: the pod's security context is re-asserted as an explicit add, with
/// the legacy fsGroup applied
#[test]
fn test_security_context_reassert_regression() {
    let mut pod = pod(serde_json::json!({
        "metadata": {"name": "p", "namespace": "apps"},
        "spec": {"containers": [{"name": "app"}]}
    }));
    let params = params(TEMPLATE, mesh(15020, false));

    let bytes = inject_pod(&YamlRenderer, &params, &mut pod, false).unwrap();
    let patch = ops(&bytes);

    let reassert = patch
        .iter()
        .find(|op| op["path"] == "/spec/securityContext")
        .expect("security context must be re-asserted");
    assert_eq!(reassert["op"], "add");
    assert_eq!(reassert["value"]["fsGroup"], 1337);
}

/// Test: prometheus merge captures the pod's scrape annotations on the
/// sidecar and points the pod annotations at the status port
#[test]
fn test_prometheus_merge_capture_and_overwrite() {
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "annotations": {"prometheus.io/port": "9090", "prometheus.io/scrape": "true"}
        },
        "spec": {"containers": [{"name": "app"}]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, true),
    )
    .unwrap();
    let patch = ops(&bytes);

    let sidecar_add = patch
        .iter()
        .find(|op| op["path"] == "/spec/containers/-")
        .unwrap();
    let env = &sidecar_add["value"]["env"];
    assert_eq!(env[0]["name"], "ISTIO_PROMETHEUS_ANNOTATIONS");
    let captured: Value = serde_json::from_str(env[0]["value"].as_str().unwrap()).unwrap();
    assert_eq!(captured["port"], "9090");
    assert_eq!(captured["scrape"], "true");

    // the pod annotations are overwritten to point at the sidecar
    assert!(patch.iter().any(|op| {
        op["path"] == "/metadata/annotations/prometheus.io~1port"
            && op["op"] == "replace"
            && op["value"] == "15020"
    }));
    assert!(patch.iter().any(|op| {
        op["path"] == "/metadata/annotations/prometheus.io~1path"
            && op["value"] == "/stats/prometheus"
    }));
}

/// Test: when the template has no sidecar the capture is skipped but the
/// annotations are still overwritten
#[test]
fn test_prometheus_merge_without_sidecar() {
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "annotations": {"prometheus.io/port": "9090"}
        },
        "spec": {"containers": [{"name": "app"}]}
    }));
    let mut sic = spec_from_yaml("containers:\n- name: helper\n  image: h:1\n");
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, true),
    )
    .unwrap();
    let patch = ops(&bytes);

    let helper_add = patch
        .iter()
        .find(|op| op["path"] == "/spec/containers/-")
        .unwrap();
    assert!(helper_add["value"].get("env").is_none());
    assert!(patch
        .iter()
        .any(|op| op["path"] == "/metadata/annotations/prometheus.io~1scrape"));
}

/// Test: canonical service and revision fall back through the label chain
#[test]
fn test_canonical_service_labels() {
    let labels = |entries: &[(&str, &str)]| -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    };

    let explicit = labels(&[
        (CANONICAL_SERVICE_LABEL, "svc"),
        (CANONICAL_REVISION_LABEL, "rev"),
        ("app", "ignored"),
    ]);
    assert_eq!(
        extract_canonical_service_labels(Some(&explicit), "wl"),
        ("svc".to_string(), "rev".to_string())
    );

    let kube_app = labels(&[
        ("app.kubernetes.io/name", "named"),
        ("app.kubernetes.io/version", "v3"),
    ]);
    assert_eq!(
        extract_canonical_service_labels(Some(&kube_app), "wl"),
        ("named".to_string(), "v3".to_string())
    );

    let app = labels(&[("app", "plain"), ("version", "v1")]);
    assert_eq!(
        extract_canonical_service_labels(Some(&app), "wl"),
        ("plain".to_string(), "v1".to_string())
    );

    assert_eq!(
        extract_canonical_service_labels(None, "wl"),
        ("wl".to_string(), "latest".to_string())
    );
}

/// Test: existing pod labels are never overwritten by the mesh labels
#[test]
fn test_mesh_labels_never_overwrite() {
    let pod = pod(serde_json::json!({
        "metadata": {
            "namespace": "ns",
            "labels": {TLS_MODE_LABEL: "disabled", "app": "mine"}
        },
        "spec": {"containers": [{"name": "app"}]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    assert!(!patch
        .iter()
        .any(|op| op["path"] == "/metadata/labels/security.istio.io~1tlsMode"));
    // canonical-name comes from the app label and is still added
    assert!(patch.iter().any(|op| {
        op["path"] == "/metadata/labels/service.istio.io~1canonical-name"
            && op["value"] == "mine"
    }));
}

/// Test: the network label is derived from the sidecar's rendered env
#[test]
fn test_network_label_from_sidecar_env() {
    let pod = pod(serde_json::json!({
        "metadata": {"namespace": "ns"},
        "spec": {"containers": [{"name": "app"}]}
    }));
    let template = r#"
containers:
- name: istio-proxy
  image: proxy:1.0
  env:
  - name: ISTIO_META_NETWORK
    value: net1
"#;
    let mut sic = spec_from_yaml(template);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    assert!(patch.iter().any(|op| {
        op["path"] == "/metadata/labels/topology.istio.io~1network" && op["value"] == "net1"
    }));
}

/// Test: holdApplicationUntilProxyStarts prepends the proxy container
#[test]
fn test_hold_application_until_proxy_starts() {
    let pod = pod(serde_json::json!({
        "metadata": {"namespace": "ns"},
        "spec": {"containers": [{"name": "app"}]}
    }));
    let template = r#"
holdApplicationUntilProxyStarts: true
containers:
- name: istio-proxy
  image: proxy:1.0
"#;
    let mut sic = spec_from_yaml(template);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    assert!(patch
        .iter()
        .any(|op| op["path"] == "/spec/containers/0" && op["value"]["name"] == "istio-proxy"));
}

/// Test: the app's service-account token mount is propagated to the sidecar
#[test]
fn test_sa_jwt_mount_propagated() {
    let pod = pod(serde_json::json!({
        "metadata": {"namespace": "ns"},
        "spec": {"containers": [{
            "name": "app",
            "volumeMounts": [{
                "name": "token",
                "mountPath": "/var/run/secrets/kubernetes.io/serviceaccount"
            }]
        }]}
    }));
    let mut sic = spec_from_yaml(TEMPLATE);
    let mut annotations = status_annotations();

    let bytes = create_patch(
        &pod,
        &injection_status(&pod),
        "default",
        &mut annotations,
        &mut sic,
        "workload",
        &mesh(15020, false),
    )
    .unwrap();
    let patch = ops(&bytes);

    let sidecar_add = patch
        .iter()
        .find(|op| op["path"] == "/spec/containers/-")
        .unwrap();
    assert_eq!(sidecar_add["value"]["volumeMounts"][0]["name"], "token");
}

/// Test: replacing the proxy run-as user rewrites the init args and the
/// sidecar security context in the rendered spec
#[test]
fn test_replace_proxy_run_as_user_id() {
    let mut sic = spec_from_yaml(TEMPLATE);

    replace_proxy_run_as_user_id(&mut sic, 2001);

    let init = &sic.init_containers[0];
    assert_eq!(init.args.as_ref().unwrap()[3], "2001");
    let sidecar = &sic.containers[0];
    assert_eq!(
        sidecar.security_context.as_ref().unwrap().run_as_user,
        Some(2001)
    );
}
