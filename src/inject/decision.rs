//! Injection decision
//!
//! Whether a pod opts into the mesh is decided entirely from the admission
//! request: namespace, pod labels, the per-pod inject annotation, and the
//! configured policy. No cluster state is consulted.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::config::{Config, InjectionPolicy};
use super::{INJECT_ANNOTATION, STATUS_ANNOTATION};

/// Namespaces the injector never touches.
pub const IGNORED_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "kube-node-lease"];

/// Decide whether the sidecar is injected into this pod.
///
/// Host-network pods and pods in ignored namespaces are never injected. An
/// explicit `sidecar.istio.io/inject` annotation overrides the selectors;
/// otherwise the never-inject selectors are consulted before the
/// always-inject selectors, and the configured policy breaks the tie.
pub fn inject_required(ignored: &[&str], config: &Config, pod: &Pod) -> bool {
    if pod
        .spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
    {
        return false;
    }

    let namespace = pod.metadata.namespace.as_deref().unwrap_or("");
    if ignored.contains(&namespace) {
        return false;
    }

    let labels = pod.metadata.labels.as_ref();
    let annotations = pod.metadata.annotations.as_ref();

    let mut use_default = false;
    let mut inject = false;
    let annotation = annotations
        .and_then(|a| a.get(INJECT_ANNOTATION))
        .map(|v| v.to_lowercase())
        .unwrap_or_default();
    match annotation.as_str() {
        // YAML truth values: http://yaml.org/type/bool.html
        "y" | "yes" | "true" | "on" => inject = true,
        "" => use_default = true,
        _ => {}
    }

    if use_default {
        for selector in &config.never_inject_selector {
            if !selector_is_empty(selector) && selector_matches(selector, labels) {
                debug!(
                    pod = %pod.metadata.name.as_deref().unwrap_or(""),
                    "explicit opt-out via neverInjectSelector"
                );
                inject = false;
                use_default = false;
                break;
            }
        }
    }

    if use_default {
        for selector in &config.always_inject_selector {
            if !selector_is_empty(selector) && selector_matches(selector, labels) {
                debug!(
                    pod = %pod.metadata.name.as_deref().unwrap_or(""),
                    "explicit opt-in via alwaysInjectSelector"
                );
                inject = true;
                use_default = false;
                break;
            }
        }
    }

    let required = match config.policy {
        InjectionPolicy::Disabled => {
            if use_default {
                false
            } else {
                inject
            }
        }
        InjectionPolicy::Enabled => {
            if use_default {
                true
            } else {
                inject
            }
        }
    };

    debug!(
        namespace = %namespace,
        pod = %pod.metadata.name.as_deref().unwrap_or(""),
        policy = ?config.policy,
        required,
        "injection policy check"
    );
    required
}

/// Whether the pod was already injected out-of-band: the status annotation
/// is present even though the decision engine said to skip.
pub fn was_injected_through_istioctl(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(STATUS_ANNOTATION))
        .unwrap_or(false)
}

/// A selector with no terms matches everything; the injector requires at
/// least one term before honoring a selector.
fn selector_is_empty(selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .as_ref()
        .map(|m| m.is_empty())
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(|e| e.is_empty())
            .unwrap_or(true)
}

/// Evaluate a label selector against a pod's labels: every matchLabels entry
/// and every matchExpressions requirement must hold.
fn selector_matches(selector: &LabelSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    if let Some(match_labels) = selector.match_labels.as_ref() {
        for (key, value) in match_labels {
            if labels.and_then(|l| l.get(key)) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = selector.match_expressions.as_ref() {
        for requirement in expressions {
            let current = labels.and_then(|l| l.get(&requirement.key));
            let values = requirement.values.as_deref().unwrap_or(&[]);
            let holds = match requirement.operator.as_str() {
                "In" => current.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => current.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => current.is_some(),
                "DoesNotExist" => current.is_none(),
                other => {
                    warn!(operator = %other, "unknown label selector operator, ignoring selector");
                    return false;
                }
            };
            if !holds {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
#[path = "decision_test.rs"]
mod tests;
