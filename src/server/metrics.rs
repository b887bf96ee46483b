//! Prometheus metrics for the injection webhook
//!
//! Four counters track the admission outcomes; the registry is exported in
//! text format at `GET /metrics`.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Shared handle to the metrics registry.
pub type SharedMetrics = Arc<InjectionMetrics>;

/// Counters for the injection webhook.
pub struct InjectionMetrics {
    registry: Registry,

    /// Total admission requests received on /inject.
    pub total: IntCounter,
    /// Requests that produced an injection patch.
    pub successful: IntCounter,
    /// Requests skipped by policy.
    pub skipped: IntCounter,
    /// Requests that failed to decode, render, or serialize.
    pub failed: IntCounter,
}

impl InjectionMetrics {
    /// Encode the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Create the registry and register the injection counters.
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let total = IntCounter::new(
        "sidecar_injection_requests_total",
        "Total number of sidecar injection requests",
    )?;
    let successful = IntCounter::new(
        "sidecar_injection_success_total",
        "Total number of successful sidecar injections",
    )?;
    let skipped = IntCounter::new(
        "sidecar_injection_skip_total",
        "Total number of skipped sidecar injections",
    )?;
    let failed = IntCounter::new(
        "sidecar_injection_failure_total",
        "Total number of failed sidecar injections",
    )?;

    registry.register(Box::new(total.clone()))?;
    registry.register(Box::new(successful.clone()))?;
    registry.register(Box::new(skipped.clone()))?;
    registry.register(Box::new(failed.clone()))?;

    Ok(Arc::new(InjectionMetrics {
        registry,
        total,
        successful,
        skipped,
        failed,
    }))
}

#[cfg(test)]
#[path = "metrics_test.rs"]
mod tests;
