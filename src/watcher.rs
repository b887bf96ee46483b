//! Hot reload of the injector configuration
//!
//! Watches the sidecar template config and the supplementary values file.
//! Filesystem events are debounced: after any event the next reload waits
//! for 100 ms of quiescence, so a burst of writes produces one update. A
//! parse failure keeps the active configuration and only logs.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::inject::config::Config;
use crate::server::shutdown::ShutdownSignal;

/// Quiescence window applied to filesystem events before reloading.
pub const WATCH_DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Callback invoked with the new (config, values) pair on every successful
/// reload.
pub type ConfigHandler = Box<dyn Fn(Config, String) + Send + Sync>;

/// Errors from loading or watching the configuration files.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse injector config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to watch config files: {0}")]
    Notify(#[from] notify::Error),
}

/// Watches the injector config file and values file for changes.
pub struct FileWatcher {
    config_file: PathBuf,
    values_file: PathBuf,
    handler: Mutex<Option<ConfigHandler>>,
}

impl FileWatcher {
    pub fn new(config_file: impl Into<PathBuf>, values_file: impl Into<PathBuf>) -> FileWatcher {
        FileWatcher {
            config_file: config_file.into(),
            values_file: values_file.into(),
            handler: Mutex::new(None),
        }
    }

    /// Load the current (config, values) pair from disk.
    pub fn get(&self) -> Result<(Config, String), WatchError> {
        let config = Config::from_yaml(&read(&self.config_file)?)?;
        let values = read(&self.values_file)?;
        Ok((config, values))
    }

    /// Register the callback invoked on every successful reload. Replaces
    /// any previously registered handler.
    pub fn set_handler(&self, handler: ConfigHandler) {
        if let Ok(mut guard) = self.handler.lock() {
            *guard = Some(handler);
        }
    }

    /// Watch until the shutdown signal fires.
    ///
    /// Config maps are updated through a symlink swap, so the parent
    /// directories are watched rather than the files themselves.
    pub async fn run(&self, mut stop: ShutdownSignal) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::channel::<Result<notify::Event, notify::Error>>(16);
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                let _ = tx.blocking_send(event);
            })?;

        let config_dir = parent_dir(&self.config_file);
        watcher.watch(config_dir, RecursiveMode::NonRecursive)?;
        let values_dir = parent_dir(&self.values_file);
        if values_dir != config_dir {
            watcher.watch(values_dir, RecursiveMode::NonRecursive)?;
        }

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        None => return Ok(()),
                        Some(Err(e)) => {
                            warn!(error = %e, "config watch error");
                            continue;
                        }
                        Some(Ok(_)) => {}
                    }
                    // Coalesce bursts: flush only after the events go quiet.
                    loop {
                        match tokio::time::timeout(WATCH_DEBOUNCE_DELAY, rx.recv()).await {
                            Err(_) => break,
                            Ok(None) => return Ok(()),
                            Ok(Some(_)) => continue,
                        }
                    }
                    self.reload();
                }
                _ = stop.wait() => return Ok(()),
            }
        }
    }

    fn reload(&self) {
        match self.get() {
            Ok((config, values)) => {
                debug!("injector configuration reloaded");
                if let Ok(guard) = self.handler.lock() {
                    if let Some(handler) = guard.as_ref() {
                        handler(config, values);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to reload injector configuration, keeping active config");
            }
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."))
}

fn read(path: &Path) -> Result<String, WatchError> {
    std::fs::read_to_string(path).map_err(|source| WatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[path = "watcher_test.rs"]
mod tests;
