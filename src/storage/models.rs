//! Installed model inventory
//!
//! Scans the models directory for GGUF files and watches it for changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::inference::validate_model_file;
use crate::types::InstalledModel;

/// Default polling interval for [`ModelWatcher`]
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gguf"))
}

/// List `*.gguf` files in `dir`, sorted by file name
///
/// A missing directory yields an empty list; entries that disappear while
/// scanning are skipped.
pub fn scan(dir: &Path) -> Vec<InstalledModel> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read models directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut models: Vec<InstalledModel> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_gguf(path))
        .filter(|path| std::fs::metadata(path).is_ok_and(|m| m.is_file()))
        .filter_map(|path| InstalledModel::from_path(&path))
        .collect();
    models.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    models
}

/// Map a conversation's model identifier to a file path
///
/// Absolute paths pass through; anything else is a file name inside `dir`.
pub fn resolve_model(dir: &Path, name: &str) -> PathBuf {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        dir.join(name)
    }
}

/// True when `path` is a file starting with the GGUF magic
pub fn validate_gguf(path: &Path) -> bool {
    validate_model_file(path).is_ok()
}

/// Polls the models directory and publishes the list when it changes
///
/// The polling task stops when the watcher is dropped.
#[derive(Debug)]
pub struct ModelWatcher {
    receiver: watch::Receiver<Vec<InstalledModel>>,
    task: JoinHandle<()>,
}

impl ModelWatcher {
    pub fn spawn(dir: PathBuf, interval: Duration) -> Self {
        let (tx, receiver) = watch::channel(scan(&dir));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let scan_dir = dir.clone();
                let models = match tokio::task::spawn_blocking(move || scan(&scan_dir)).await {
                    Ok(models) => models,
                    Err(e) => {
                        tracing::warn!("Model scan failed: {}", e);
                        continue;
                    }
                };
                let changed = tx.send_if_modified(|current| {
                    if *current != models {
                        *current = models;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    tracing::info!("Models directory changed: {} models", tx.borrow().len());
                }
            }
        });
        Self { receiver, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<InstalledModel>> {
        self.receiver.clone()
    }

    pub fn current(&self) -> Vec<InstalledModel> {
        self.receiver.borrow().clone()
    }
}

impl Drop for ModelWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
