//! HTTP server for the webhook, health, and metrics endpoints
//!
//! - `POST /inject[/<kv-pairs>]` - mutating admission webhook
//! - `GET /healthz` - liveness probe (process is running)
//! - `GET /readyz` - readiness probe (webhook is ready to serve)
//! - `GET /metrics` - Prometheus metrics in text format
//!
//! A separate task can periodically touch a health-check file for platforms
//! that probe liveness through the filesystem.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use crate::server::webhook::{handle_inject, Webhook};

/// Shared readiness flag. Flipped once the webhook has its initial
/// configuration, and back off during shutdown so traffic drains.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    pub fn new() -> ReadinessState {
        ReadinessState::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

/// Build the router serving the webhook alongside health and metrics.
pub fn build_router(
    webhook: Arc<Webhook>,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> Router {
    let state = ServerState { readiness, metrics };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .with_state(state)
        .route("/inject", post(handle_inject).with_state(webhook.clone()))
        .route(
            "/inject/",
            post(handle_inject).with_state(webhook.clone()),
        )
        .route(
            "/inject/*params",
            post(handle_inject).with_state(webhook),
        )
}

/// Run the server over plain HTTP. Intended for tests and for deployments
/// that terminate TLS in front of the webhook.
pub async fn run_server(port: u16, router: Router) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "webhook server listening (HTTP)");

    axum::serve(listener, router)
        .await
        .map_err(std::io::Error::other)
}

/// Run the server over HTTPS with the given rustls config.
pub async fn run_server_tls(
    port: u16,
    router: Router,
    tls_config: Arc<rustls::ServerConfig>,
) -> Result<(), std::io::Error> {
    use axum_server::tls_rustls::RustlsConfig;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let config = RustlsConfig::from_config(tls_config);
    info!(port = %port, "webhook server listening (HTTPS)");

    axum_server::bind_rustls(addr, config)
        .serve(router.into_make_service())
        .await
}

/// Periodically write the literal bytes `ok` to the health-check file until
/// shutdown. Write failures are logged and do not stop the task.
pub async fn run_health_file_writer(
    interval: Duration,
    path: PathBuf,
    mut stop: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    // the immediate first tick would race startup; skip it
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tokio::fs::write(&path, b"ok").await {
                    warn!(path = %path.display(), error = %e, "health check update failed");
                }
            }
            _ = stop.wait() => return,
        }
    }
}

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;
