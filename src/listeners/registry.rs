use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, WardenError};
use crate::listeners::rules::{ListenerConfig, RuleFile};
use crate::types::EventKind;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// A loaded listener: its surfaced config plus the rule that acts as its
/// handler. The source path is kept for the UI listing.
#[derive(Debug, Clone)]
pub struct ListenerModule {
    pub config: ListenerConfig,
    pub rule: RuleFile,
    pub path: PathBuf,
}

/// Registry counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub enabled: usize,
    pub by_event: HashMap<String, usize>,
}

/// Owns the set of loaded listener modules. `load_all` rebuilds the whole
/// set from disk and swaps it in atomically; readers never see a partially
/// loaded registry.
pub struct ListenerRegistry {
    dir: PathBuf,
    active: RwLock<HashMap<String, Arc<ListenerModule>>>,
    all: RwLock<Vec<ListenerConfig>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    change_tx: flume::Sender<Vec<ListenerConfig>>,
}

/// Files starting with `.` or `_` are ignored, as is anything that isn't a
/// rule file.
fn is_listener_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("toml") {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => !name.starts_with('.') && !name.starts_with('_'),
        None => false,
    }
}

impl ListenerRegistry {
    /// Create a registry over `dir`. The returned channel carries the new
    /// config list after every successful hot reload.
    pub fn new(dir: impl Into<PathBuf>) -> (Arc<Self>, flume::Receiver<Vec<ListenerConfig>>) {
        let (change_tx, change_rx) = flume::unbounded();
        let registry = Arc::new(Self {
            dir: dir.into(),
            active: RwLock::new(HashMap::new()),
            all: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
            change_tx,
        });
        (registry, change_rx)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescan the directory and replace the active set. Individual file
    /// failures are logged and skipped; disabled listeners are remembered
    /// for listing but never dispatched. Returns the active count.
    pub fn load_all(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)?;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_listener_file(path))
            .collect();
        entries.sort();

        let mut active: HashMap<String, Arc<ListenerModule>> = HashMap::new();
        let mut all: Vec<ListenerConfig> = Vec::new();

        for path in entries {
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), "failed to read listener file: {}", e);
                    continue;
                }
            };
            let rule = match RuleFile::parse(&source) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(path = %path.display(), "invalid listener file: {}", e);
                    continue;
                }
            };

            let config = rule.config();
            if active.contains_key(&config.id) {
                warn!(id = %config.id, path = %path.display(), "duplicate listener id, keeping first");
                continue;
            }

            all.push(config.clone());
            if config.enabled {
                debug!(id = %config.id, event = %config.event, "registered listener");
                active.insert(
                    config.id.clone(),
                    Arc::new(ListenerModule { config, rule, path }),
                );
            } else {
                debug!(id = %config.id, "listener disabled, listing only");
            }
        }

        let count = active.len();
        // Atomic swap of the whole set.
        *self.active.write().expect("registry lock poisoned") = active;
        *self.all.write().expect("registry lock poisoned") = all;
        info!(active = count, dir = %self.dir.display(), "listener registry loaded");
        Ok(count)
    }

    /// Active module by id.
    pub fn get(&self, id: &str) -> Option<Arc<ListenerModule>> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Configs of the active (enabled) listeners, sorted by id.
    pub fn get_all(&self) -> Vec<ListenerConfig> {
        let mut configs: Vec<ListenerConfig> = self
            .active
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|module| module.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Every discovered listener, disabled ones included.
    pub fn all(&self) -> Vec<ListenerConfig> {
        self.all.read().expect("registry lock poisoned").clone()
    }

    /// Active modules subscribed to `kind`, sorted by id for deterministic
    /// dispatch.
    pub fn modules_for(&self, kind: EventKind) -> Vec<Arc<ListenerModule>> {
        let mut modules: Vec<Arc<ListenerModule>> = self
            .active
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|module| module.config.event == kind)
            .cloned()
            .collect();
        modules.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        modules
    }

    pub fn stats(&self) -> RegistryStats {
        let active = self.active.read().expect("registry lock poisoned");
        let mut by_event: HashMap<String, usize> = HashMap::new();
        for module in active.values() {
            *by_event.entry(module.config.event.to_string()).or_default() += 1;
        }
        RegistryStats {
            total: self.all.read().expect("registry lock poisoned").len(),
            enabled: active.len(),
            by_event,
        }
    }

    /// Start the directory watcher. Any rule-file change triggers a
    /// debounced full reload followed by a change broadcast. Calling this a
    /// second time is a no-op.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.watcher.lock().expect("watcher lock poisoned");
        if guard.is_some() {
            debug!("listener watcher already running");
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;

        let (fs_tx, fs_rx) = flume::unbounded::<()>();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let relevant = event.paths.is_empty()
                            || event.paths.iter().any(|p| is_listener_file(p));
                        if relevant {
                            let _ = fs_tx.send(());
                        }
                    }
                    Err(e) => warn!("listener watcher error: {}", e),
                }
            })
            .map_err(|e| WardenError::Listener(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| WardenError::Listener(format!("failed to watch {}: {}", self.dir.display(), e)))?;
        *guard = Some(watcher);
        drop(guard);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while fs_rx.recv_async().await.is_ok() {
                // Debounce: a save often produces several events, and a file
                // added then removed must resolve to one final registry.
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while fs_rx.try_recv().is_ok() {}

                match registry.load_all() {
                    Ok(count) => {
                        info!(active = count, "listener registry reloaded");
                        let _ = registry.change_tx.send(registry.get_all());
                    }
                    Err(e) => warn!("listener reload failed: {}", e),
                }
            }
        });

        info!(dir = %self.dir.display(), "listener watcher started");
        Ok(())
    }
}
