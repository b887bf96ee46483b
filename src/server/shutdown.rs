//! Shutdown fan-out for the injector's long-lived tasks
//!
//! The config watcher, the health-file writer, and the HTTP server each hold
//! a [`ShutdownSignal`] subscribed from the single [`Shutdown`] owner in
//! `main`. Triggering stops new work only: in-flight admission requests run
//! to completion.

use tokio::sync::watch;
use tracing::info;

/// Owner of the shutdown channel.
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (sender, _) = watch::channel(false);
        Shutdown { sender }
    }

    /// Hand out a signal handle for a long-lived task to select on.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Stop every subscribed task. Idempotent.
    pub fn trigger(&self) {
        let already_triggered = self.sender.send_replace(true);
        if !already_triggered {
            info!("shutdown triggered");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

/// A task's view of the shutdown channel.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered. A dropped [`Shutdown`] owner
    /// counts as shutdown too.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Resolve when the platform asks the process to stop, returning the signal
/// name. SIGTERM is what the orchestrator sends on pod deletion; SIGINT
/// covers interactive runs.
///
/// # Panics
/// Panics if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn terminated() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

/// Resolve on Ctrl+C (non-Unix platforms).
///
/// # Panics
/// Panics if the Ctrl+C handler cannot be registered.
#[cfg(not(unix))]
pub async fn terminated() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to wait for Ctrl+C");
    "CTRL_C"
}

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod tests;
