//! Proxy UID/GID resolution
//!
//! Traffic interception identifies proxy-owned packets by UID, so the
//! sidecar must run as a UID no other container in the pod uses. The chosen
//! UID is one above the highest UID already claimed by the pod.

use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use super::PROXY_UID_ANNOTATION;

/// UID and GID the sidecar runs as when the pod claims none of its own.
pub const DEFAULT_SIDECAR_PROXY_UID: u64 = 1337;

/// Resolve the UID and GID the sidecar proxy will run as.
///
/// Priority:
/// 1. The `sidecar.istio.io/proxyUID` annotation, when it parses as u64.
/// 2. Pod-level `securityContext.runAsUser`: UID is that value plus one, GID
///    is the value itself.
/// 3. Container-level `runAsUser` values: UID is the maximum plus one, GID
///    is the first one seen.
/// 4. The 1337 default for both.
pub fn resolve_proxy_ids(pod: &Pod) -> (u64, i64) {
    let mut proxy_uid: Option<u64> = None;
    let mut proxy_gid: Option<i64> = None;

    if let Some(value) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROXY_UID_ANNOTATION))
    {
        match value.parse::<u64>() {
            Ok(uid) => proxy_uid = Some(uid),
            Err(e) => info!(
                annotation = PROXY_UID_ANNOTATION,
                value = %value,
                error = %e,
                "could not parse proxy UID annotation"
            ),
        }
    }

    if proxy_uid.is_none() {
        if let Some(spec) = pod.spec.as_ref() {
            if let Some(run_as) = spec
                .security_context
                .as_ref()
                .and_then(|sc| sc.run_as_user)
            {
                proxy_uid = Some(run_as as u64 + 1);
                proxy_gid = Some(run_as);
            }
            for container in &spec.containers {
                let Some(run_as) = container
                    .security_context
                    .as_ref()
                    .and_then(|sc| sc.run_as_user)
                else {
                    continue;
                };
                let uid = run_as as u64 + 1;
                if proxy_uid.is_none() || uid > proxy_uid.unwrap_or(0) {
                    proxy_uid = Some(uid);
                }
                if proxy_gid.is_none() {
                    proxy_gid = Some(run_as);
                }
            }
        }
    }

    (
        proxy_uid.unwrap_or(DEFAULT_SIDECAR_PROXY_UID),
        proxy_gid.unwrap_or(DEFAULT_SIDECAR_PROXY_UID as i64),
    )
}

#[cfg(test)]
#[path = "uid_test.rs"]
mod tests;
