use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sidecar_injector::inject::mesh::MeshConfig;
use sidecar_injector::inject::template::YamlRenderer;
use sidecar_injector::server::{
    build_router, create_metrics, load_server_config, run_health_file_writer, run_server,
    run_server_tls, terminated, ReadinessState, Shutdown, Webhook, WebhookParameters,
};
use sidecar_injector::watcher::FileWatcher;
use tracing::{error, info, warn};

/// Default port for the webhook endpoints
const WEBHOOK_PORT: u16 = 9443;

/// Get the sidecar template config file path from env
fn get_config_file() -> PathBuf {
    std::env::var("INJECTOR_CONFIG_FILE")
        .unwrap_or_else(|_| "/etc/injector/config".to_string())
        .into()
}

/// Get the supplementary values file path from env
fn get_values_file() -> PathBuf {
    std::env::var("INJECTOR_VALUES_FILE")
        .unwrap_or_else(|_| "/etc/injector/values".to_string())
        .into()
}

/// Get the optional mesh config file path from env
fn get_mesh_config_file() -> Option<PathBuf> {
    std::env::var("INJECTOR_MESH_CONFIG_FILE").ok().map(Into::into)
}

/// Get the mesh revision this injector serves (default: default)
fn get_revision() -> String {
    std::env::var("INJECTOR_REVISION").unwrap_or_else(|_| "default".to_string())
}

/// Get the webhook port from env (default: 9443)
fn get_webhook_port() -> u16 {
    std::env::var("INJECTOR_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(WEBHOOK_PORT)
}

/// Check if webhook TLS is enabled via env var
fn is_tls_enabled() -> bool {
    std::env::var("INJECTOR_TLS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Get the health check file path and interval, when configured
fn get_health_check() -> Option<(PathBuf, Duration)> {
    let file = std::env::var("INJECTOR_HEALTH_CHECK_FILE").ok()?;
    let interval = std::env::var("INJECTOR_HEALTH_CHECK_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);
    if interval == 0 {
        return None;
    }
    Some((file.into(), Duration::from_secs(interval)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting sidecar injection webhook");

    // Install ring as the default crypto provider for rustls; the provider
    // must be picked before any TLS config is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Shutdown fan-out for the watcher, health writer, and server tasks
    let shutdown = Shutdown::new();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    // Create metrics registry
    let metrics = create_metrics().expect("Failed to create metrics registry");

    // Load the initial injector configuration
    let watcher = Arc::new(FileWatcher::new(get_config_file(), get_values_file()));
    let (config, values_config) = match watcher.get() {
        Ok(initial) => initial,
        Err(e) => {
            error!(error = %e, "Failed to load injector configuration");
            return Err(e.into());
        }
    };
    info!("Injector configuration loaded");

    // Load the mesh config snapshot, or fall back to defaults
    let mesh_config = match get_mesh_config_file() {
        Some(path) => {
            let data = std::fs::read_to_string(&path)?;
            MeshConfig::from_yaml(&data)?
        }
        None => MeshConfig::default(),
    };

    let webhook = Webhook::new(WebhookParameters {
        config,
        values_config,
        mesh_config,
        renderer: Arc::new(YamlRenderer),
        revision: get_revision(),
        metrics: metrics.clone(),
    });

    // Hot reload: every successful config flush swaps the active triple
    {
        let webhook = webhook.clone();
        watcher.set_handler(Box::new(move |config, values| {
            webhook.update_config(config, values);
        }));
    }
    let watcher_signal = shutdown.subscribe();
    let watcher_task = {
        let watcher = watcher.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.run(watcher_signal).await {
                warn!(error = %e, "config watcher failed");
            }
        })
    };

    // Optional periodic health-file writer
    let health_task = get_health_check().map(|(path, interval)| {
        info!(path = %path.display(), "Health check file writer enabled");
        tokio::spawn(run_health_file_writer(interval, path, shutdown.subscribe()))
    });

    // Start the webhook server
    let port = get_webhook_port();
    let router = build_router(webhook, readiness.clone(), metrics);
    let mut server_task = if is_tls_enabled() {
        let cert = PathBuf::from(
            std::env::var("INJECTOR_TLS_CERT_FILE")
                .unwrap_or_else(|_| "/etc/injector/tls.crt".to_string()),
        );
        let key = PathBuf::from(
            std::env::var("INJECTOR_TLS_KEY_FILE")
                .unwrap_or_else(|_| "/etc/injector/tls.key".to_string()),
        );
        let tls_config = match load_server_config(&cert, &key) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load webhook TLS certificate");
                return Err(e.into());
            }
        };
        tokio::spawn(async move {
            if let Err(e) = run_server_tls(port, router, tls_config).await {
                warn!(error = %e, "HTTPS server failed");
            }
        })
    } else {
        info!("Webhook TLS disabled - running HTTP only");
        tokio::spawn(async move {
            if let Err(e) = run_server(port, router).await {
                warn!(error = %e, "HTTP server failed");
            }
        })
    };

    // Ready to serve admission requests
    readiness.set_ready();
    info!(port = port, "Injection webhook ready");

    tokio::select! {
        _ = &mut server_task => {
            error!("Webhook server task ended unexpectedly");
        }
        signal = terminated() => {
            info!(signal = signal, "Initiating graceful shutdown");
        }
    }

    // Mark not ready so traffic drains, then stop the background tasks
    readiness.set_not_ready();
    shutdown.trigger();

    if let Some(handle) = health_task {
        let _ = handle.await;
    }
    let _ = watcher_task.await;
    server_task.abort();

    info!("Injection webhook shut down gracefully");
    Ok(())
}
