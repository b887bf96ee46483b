//! Injector configuration
//!
//! The injector config is a YAML document shipped next to the sidecar
//! template. It controls the injection decision (policy, always/never
//! selectors) and carries the template text itself plus any extra
//! annotations the injector stamps onto every injected pod.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Whether pods are injected by default when no annotation or selector says
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionPolicy {
    /// Inject unless a pod opts out.
    Enabled,
    /// Inject only pods that opt in.
    Disabled,
}

impl Default for InjectionPolicy {
    fn default() -> Self {
        InjectionPolicy::Disabled
    }
}

/// Sidecar injector configuration, parsed from the config file watched by
/// [`crate::watcher::FileWatcher`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Default injection policy when neither annotation nor selector decides.
    pub policy: InjectionPolicy,

    /// Sidecar template text, handed to the renderer verbatim.
    pub template: String,

    /// Pods whose labels match any of these selectors are always injected,
    /// regardless of policy.
    pub always_inject_selector: Vec<LabelSelector>,

    /// Pods whose labels match any of these selectors are never injected,
    /// regardless of policy. Checked before the always selectors.
    pub never_inject_selector: Vec<LabelSelector>,

    /// Extra annotations stamped onto every injected pod.
    pub injected_annotations: BTreeMap<String, String>,
}

impl Config {
    /// Parse a config document from YAML.
    pub fn from_yaml(data: &str) -> Result<Config, serde_yaml::Error> {
        let config: Config = serde_yaml::from_str(data)?;
        debug!(
            sha256 = %hex::encode(Sha256::digest(data.as_bytes())),
            policy = ?config.policy,
            "new inject configuration"
        );
        Ok(config)
    }
}

/// Content hash identifying a template revision. Recorded in the injection
/// status annotation so a later re-injection can tell which template version
/// produced the pod.
pub fn template_version_hash(template: &str) -> String {
    hex::encode(Sha256::digest(template.as_bytes()))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
