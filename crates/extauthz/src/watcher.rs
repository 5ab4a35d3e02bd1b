//! Policy directory loading and hot reload
//!
//! `.rego` files in the policy directory become modules keyed by file name.
//! The watcher debounces filesystem events and swaps the whole module set,
//! which fires a single recompilation event on the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ExtAuthzError, Result};
use crate::store::MemoryStore;

const POLICY_EXTENSION: &str = "rego";
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Read every `.rego` file directly under `dir`
pub fn load_policy_dir(dir: &Path) -> Result<BTreeMap<String, String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ExtAuthzError::config(format!(
            "failed to read policy directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut modules = BTreeMap::new();
    for entry in entries {
        let path = entry
            .map_err(|e| ExtAuthzError::config(format!("failed to list policies: {}", e)))?
            .path();
        if !is_policy_file(&path) {
            continue;
        }
        let source = std::fs::read_to_string(&path).map_err(|e| {
            ExtAuthzError::config(format!("failed to read policy {}: {}", path.display(), e))
        })?;
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        modules.insert(id, source);
    }
    Ok(modules)
}

/// Read a JSON or YAML data document
pub fn load_data_file(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path).map_err(|e| {
        ExtAuthzError::config(format!("failed to read data file {}: {}", path.display(), e))
    })?;
    serde_yaml::from_slice(&bytes).map_err(|e| {
        ExtAuthzError::config(format!("failed to parse data file {}: {}", path.display(), e))
    })
}

fn is_policy_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == POLICY_EXTENSION)
}

/// Running policy directory watch
///
/// Dropping the handle stops watching.
pub struct PolicyWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl PolicyWatcher {
    /// Watch `dir` and reload its modules into `store` on change
    pub fn spawn(store: Arc<MemoryStore>, dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(10);

        let mut debouncer = new_debouncer(DEBOUNCE, move |res: DebounceEventResult| match res {
            Ok(events) => {
                if events.iter().any(|event| {
                    event
                        .path
                        .extension()
                        .is_some_and(|ext| ext == POLICY_EXTENSION)
                }) {
                    // Full channel means a reload is already queued
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "Policy watch error"),
        })
        .map_err(|e| ExtAuthzError::config(format!("failed to create file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ExtAuthzError::config(format!(
                    "failed to watch policy directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        info!(dir = %dir.display(), "Watching for policy changes");

        let task = tokio::spawn(reload_loop(store, dir.to_path_buf(), rx));

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }
}

impl Drop for PolicyWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reload_loop(store: Arc<MemoryStore>, dir: PathBuf, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        let loaded = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || load_policy_dir(&dir)).await
        };
        match loaded {
            Ok(Ok(modules)) => {
                info!(modules = modules.len(), "Reloading policies");
                store.replace_policies(modules);
            }
            Ok(Err(e)) => error!(error = %e, "Failed to reload policies"),
            Err(e) => error!(error = %e, "Policy reload task failed"),
        }
    }
}
