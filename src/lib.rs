//! Mutating admission webhook for automatic service-mesh sidecar injection
//!
//! When the cluster is about to create a pod, the orchestrator consults this
//! service over HTTPS. The service decides whether the workload opts into the
//! mesh and, if so, answers with an RFC 6902 JSON Patch that rewrites the pod
//! spec: sidecar and init containers, volumes, image pull secrets, DNS
//! config, security context, probe rewrites, labels, and annotations.
//!
//! # Modules
//!
//! - [`inject`] - injection decision, patch construction, probe rewriting
//! - [`watcher`] - hot reload of the sidecar template and values files
//! - [`server`] - admission HTTP surface, health endpoints, metrics, shutdown

pub mod inject;
pub mod server;
pub mod watcher;
