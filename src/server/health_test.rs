//! Tests for the health endpoints and the health-file writer

use super::*;
use crate::inject::config::Config;
use crate::inject::mesh::MeshConfig;
use crate::inject::template::YamlRenderer;
use crate::server::metrics::create_metrics;
use crate::server::shutdown::Shutdown;
use crate::server::webhook::{Webhook, WebhookParameters};
use std::time::Duration;

fn test_router(readiness: ReadinessState) -> axum::Router {
    let metrics = create_metrics().unwrap();
    let webhook = Webhook::new(WebhookParameters {
        config: Config {
            template: "containers: []".to_string(),
            ..Default::default()
        },
        values_config: String::new(),
        mesh_config: MeshConfig::default(),
        renderer: Arc::new(YamlRenderer),
        revision: "default".to_string(),
        metrics: metrics.clone(),
    });
    build_router(webhook, readiness, metrics)
}

/// Wait for the server to accept connections, with retry
async fn wait_for_server(port: u16) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);
    for attempt in 1..=20 {
        match client
            .get(format!("http://127.0.0.1:{port}/healthz"))
            .timeout(Duration::from_millis(200))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < 20 => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("server not ready: {e}"),
        }
    }
    client
}

/// Test: /healthz always answers 200
#[tokio::test]
async fn test_healthz_returns_200() {
    let port = 18090;
    let router = test_router(ReadinessState::new());
    let server = tokio::spawn(async move {
        let _ = run_server(port, router).await;
    });

    let client = wait_for_server(port).await;
    let response = client
        .get(format!("http://127.0.0.1:{port}/healthz"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    server.abort();
}

/// Test: /readyz follows the readiness state
#[tokio::test]
async fn test_readyz_follows_readiness() {
    let port = 18091;
    let readiness = ReadinessState::new();
    let router = test_router(readiness.clone());
    let server = tokio::spawn(async move {
        let _ = run_server(port, router).await;
    });

    let client = wait_for_server(port).await;
    let url = format!("http://127.0.0.1:{port}/readyz");

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 503, "not ready yet");

    readiness.set_ready();
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 200, "ready after set_ready()");

    readiness.set_not_ready();
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 503, "draining after set_not_ready()");

    server.abort();
}

/// Test: /metrics serves the injection counters in text format
#[tokio::test]
async fn test_metrics_endpoint() {
    let port = 18092;
    let router = test_router(ReadinessState::new());
    let server = tokio::spawn(async move {
        let _ = run_server(port, router).await;
    });

    let client = wait_for_server(port).await;
    let response = client
        .get(format!("http://127.0.0.1:{port}/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("sidecar_injection_requests_total"));

    server.abort();
}

/// Test: readiness state transitions and clones share state
#[test]
fn test_readiness_state_transitions() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    state.set_ready();
    assert!(state.is_ready());

    let cloned = state.clone();
    cloned.set_not_ready();
    assert!(!state.is_ready());
}

/// Test: the health-file writer periodically writes `ok` and stops on
/// shutdown
#[tokio::test]
async fn test_health_file_writer() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("health");
    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();

    let writer = tokio::spawn(run_health_file_writer(
        Duration::from_millis(50),
        path.clone(),
        signal,
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let content = std::fs::read_to_string(&path).expect("health file must exist");
    assert_eq!(content, "ok");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), writer)
        .await
        .expect("writer did not stop on shutdown")
        .unwrap();
}
