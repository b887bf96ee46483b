//! Tests for application probe rewriting

use super::*;
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;

fn pod_with_probes() -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": "test"},
        "spec": {"containers": [
            {
                "name": "app",
                "readinessProbe": {
                    "httpGet": {"path": "/healthz", "port": 8080},
                    "periodSeconds": 5
                }
            },
            {
                "name": "tcp-only",
                "livenessProbe": {"tcpSocket": {"port": 9000}}
            }
        ]}
    }))
    .unwrap()
}

/// Test: scenario from the probe-rewrite contract - a readiness probe is
/// replaced with an HTTPGet against the status port
#[test]
fn test_probe_rewrite_targets_status_port() {
    let pod = pod_with_probes();

    let patch = probe_rewrite_patch(pod.spec.as_ref().unwrap(), 15020).unwrap();

    assert_eq!(patch.len(), 1);
    let op = serde_json::to_value(&patch[0]).unwrap();
    assert_eq!(op["op"], "replace");
    assert_eq!(op["path"], "/spec/containers/0/readinessProbe");
    assert_eq!(op["value"]["httpGet"]["path"], "/app-health/app/readyz");
    assert_eq!(op["value"]["httpGet"]["port"], 15020);
    // the rest of the probe is preserved
    assert_eq!(op["value"]["periodSeconds"], 5);
}

/// Test: TCP and exec probes are left untouched
#[test]
fn test_non_http_probes_untouched() {
    let pod: Pod = serde_json::from_value(json!({
        "spec": {"containers": [{
            "name": "app",
            "livenessProbe": {"tcpSocket": {"port": 9000}},
            "readinessProbe": {"exec": {"command": ["true"]}}
        }]}
    }))
    .unwrap();

    let patch = probe_rewrite_patch(pod.spec.as_ref().unwrap(), 15020).unwrap();

    assert!(patch.is_empty());
}

/// Test: the sidecar's own probes are never rewritten
#[test]
fn test_sidecar_probes_skipped() {
    let pod: Pod = serde_json::from_value(json!({
        "spec": {"containers": [{
            "name": "istio-proxy",
            "readinessProbe": {"httpGet": {"path": "/ready", "port": 15021}}
        }]}
    }))
    .unwrap();

    let patch = probe_rewrite_patch(pod.spec.as_ref().unwrap(), 15020).unwrap();

    assert!(patch.is_empty());
}

/// Test: the probers dump maps the status path to the original HTTPGet
#[test]
fn test_dump_app_probers() {
    let pod = pod_with_probes();

    let dump = dump_app_probers(&pod).unwrap().unwrap();
    let probers: serde_json::Value = serde_json::from_str(&dump).unwrap();

    assert_eq!(
        probers["/app-health/app/readyz"]["httpGet"]["path"],
        "/healthz"
    );
    assert_eq!(probers["/app-health/app/readyz"]["httpGet"]["port"], 8080);
    // the TCP-only container contributes nothing
    assert_eq!(probers.as_object().unwrap().len(), 1);
}

/// Test: no HTTPGet probes means no env var at all
#[test]
fn test_dump_app_probers_empty() {
    let pod: Pod = serde_json::from_value(json!({
        "spec": {"containers": [{"name": "app"}]}
    }))
    .unwrap();

    assert!(dump_app_probers(&pod).unwrap().is_none());
}

/// Test: the per-pod annotation overrides the template flag in both
/// directions, and an invalid value falls back to the template
#[test]
fn test_should_rewrite_annotation_override() {
    let spec_on = SidecarInjectionSpec {
        rewrite_app_http_probe: true,
        ..Default::default()
    };
    let spec_off = SidecarInjectionSpec::default();

    let on = BTreeMap::from([(REWRITE_PROBERS_ANNOTATION.to_string(), "true".to_string())]);
    let off = BTreeMap::from([(REWRITE_PROBERS_ANNOTATION.to_string(), "false".to_string())]);
    let bad = BTreeMap::from([(REWRITE_PROBERS_ANNOTATION.to_string(), "maybe".to_string())]);

    assert!(should_rewrite_app_http_probers(Some(&on), &spec_off));
    assert!(!should_rewrite_app_http_probers(Some(&off), &spec_on));
    assert!(should_rewrite_app_http_probers(Some(&bad), &spec_on));
    assert!(should_rewrite_app_http_probers(None, &spec_on));
    assert!(!should_rewrite_app_http_probers(None, &spec_off));
}
