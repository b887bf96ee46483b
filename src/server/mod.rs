//! HTTP surface of the injector
//!
//! - [`webhook`] - the mutating admission endpoint
//! - [`health`] - liveness/readiness probes, metrics, health-file writer
//! - [`metrics`] - injection counters
//! - [`shutdown`] - graceful shutdown coordination
//! - [`tls`] - loading the serving certificate

pub mod health;
pub mod metrics;
pub mod shutdown;
pub mod tls;
pub mod webhook;

pub use health::{build_router, run_health_file_writer, run_server, run_server_tls, ReadinessState};
pub use metrics::{create_metrics, InjectionMetrics, SharedMetrics};
pub use shutdown::{terminated, Shutdown, ShutdownSignal};
pub use tls::{load_server_config, TlsError};
pub use webhook::{Webhook, WebhookParameters};
