// src/config.rs

//! Layered agent configuration: built-in defaults, the on-disk config file,
//! a remote per-node snapshot, and an on-disk cache of the last good snapshot.
//! Secrets live in a separate, owner-only file and are never reachable
//! through the normal `get` path.

use crate::core::errors::AgentError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a remote snapshot is considered fresh before `should_sync` asks for another.
const REMOTE_SYNC_TTL: Duration = Duration::from_secs(3600);

/// The timeout for the remote snapshot fetch.
const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A mapping from changed dot-path to `(old, new)`. Additions carry
/// `Value::Null` as the old value, removals as the new one.
pub type ChangeSet = IndexMap<String, (Value, Value)>;

/// Resolved locations of the agent's on-disk configuration state.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub dir: PathBuf,
    pub config_file: PathBuf,
    pub secrets_file: PathBuf,
    pub cache_file: PathBuf,
}

impl ConfigPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            config_file: dir.join("config.json"),
            secrets_file: dir.join("secrets.json"),
            cache_file: dir.join("config_cache.json"),
            dir,
        }
    }
}

/// Built-in defaults. Every key the agent reads at runtime is present here,
/// so a missing or partial config file still yields a fully working tree.
pub fn default_config() -> Value {
    json!({
        "connectivity": {
            "api_url": "http://localhost:3000/api",
            "telemetry_backend_url": "http://localhost:3000",
        },
        "messaging": {
            "bus": {
                "url": "nats://127.0.0.1:4222",
                "subject": "error_logs_queue",
            }
        },
        "telemetry": {
            "retry_backoff": [5, 15, 60],
            "timeout": 10,
            "queue_db_path": "telemetry_queue.db",
            "queue_max_size": 1000,
            "post_interval": 60,
            "post_batch_size": 10,
            "max_retries": 3,
        },
        "monitoring": {
            "log_files": [],
            "error_keywords": [
                "emerg", "emergency", "alert", "crit", "critical",
                "err", "error", "fail", "failed", "failure", "panic", "fatal",
            ],
            "priority_keywords": {
                "critical": ["panic", "fatal", "emerg", "emergency", "segfault", "out of memory"],
                "high": ["err", "error", "fail", "denied", "refused"],
            },
        },
        "alerts": {
            "thresholds": {
                "cpu_critical":       { "threshold": 90, "duration": 300, "priority": "critical", "cooldown": 1800 },
                "cpu_high":           { "threshold": 75, "duration": 600, "priority": "high",     "cooldown": 3600 },
                "memory_critical":    { "threshold": 95, "duration": 300, "priority": "critical", "cooldown": 1800 },
                "memory_high":        { "threshold": 85, "duration": 600, "priority": "high",     "cooldown": 3600 },
                "disk_critical":      { "threshold": 90, "duration": 0,   "priority": "critical", "cooldown": 7200 },
                "disk_high":          { "threshold": 80, "duration": 0,   "priority": "high",     "cooldown": 14400 },
                "network_spike":      { "threshold_multiplier": 5, "duration": 60, "priority": "medium", "cooldown": 1800 },
                "high_process_count": { "threshold": 500, "duration": 300, "priority": "medium", "cooldown": 3600 },
            }
        },
        "ports": {
            "control": 8754,
            "livelogs": 8755,
            "telemetry_ws": 8756,
        },
        "intervals": {
            "telemetry": 3,
            "heartbeat": 30,
        },
        "logging": {
            "level": "info",
            "path": "vigild.log",
        },
        "suppression": {
            "db_path": "suppression.db",
            "cache_ttl": 60,
        },
        "node": {
            "id": null,
        },
    })
}

/// The layered configuration store shared by every worker.
///
/// Readers observe a consistent view per call; writes are serialized through
/// `set`/`save`/`reload`. The tree itself is replaced or mutated only while
/// the write lock is held.
pub struct ConfigStore {
    paths: ConfigPaths,
    tree: RwLock<Value>,
    secrets: RwLock<Value>,
    node_id: RwLock<Option<String>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("dir", &self.paths.dir)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Creates the store from the local layers only (defaults + config file
    /// + secrets). Remote sync happens later, once the node id is known.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let paths = ConfigPaths::new(dir);
        fs::create_dir_all(&paths.dir)?;

        let store = Self {
            paths,
            tree: RwLock::new(default_config()),
            secrets: RwLock::new(json!({})),
            node_id: RwLock::new(None),
            last_sync: Mutex::new(None),
        };
        store.load_local();
        Ok(store)
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn set_node_id(&self, node_id: &str) {
        *self.node_id.write() = Some(node_id.to_string());
    }

    /// Merges the on-disk config file and reloads the secrets file.
    fn load_local(&self) {
        if self.paths.config_file.exists() {
            match fs::read_to_string(&self.paths.config_file)
                .map_err(AgentError::from)
                .and_then(|s| serde_json::from_str::<Value>(&s).map_err(AgentError::from))
            {
                Ok(local) => {
                    deep_merge(&mut self.tree.write(), &local);
                    info!("loaded local config from {}", self.paths.config_file.display());
                }
                Err(e) => error!("failed to load local config: {e}"),
            }
        }

        if self.paths.secrets_file.exists() {
            match fs::read_to_string(&self.paths.secrets_file)
                .map_err(AgentError::from)
                .and_then(|s| serde_json::from_str::<Value>(&s).map_err(AgentError::from))
            {
                Ok(secrets) => {
                    *self.secrets.write() = secrets;
                    restrict_permissions(&self.paths.secrets_file);
                    info!("loaded secrets from {}", self.paths.secrets_file.display());
                }
                Err(e) => error!("failed to load secrets: {e}"),
            }
        }
    }

    /// Fetches the per-node snapshot from the backend. On success the snapshot
    /// is deep-merged and persisted to the cache file; on failure the last
    /// cached snapshot is merged instead.
    pub async fn sync_remote(&self, http: &reqwest::Client) {
        let Some(node_id) = self.node_id.read().clone() else {
            info!("no node id known yet, skipping remote config sync");
            return;
        };
        let backend = self.get_str("connectivity.telemetry_backend_url");
        let url = format!("{}/api/settings/daemon/{node_id}", backend.trim_end_matches('/'));

        match self.fetch_remote(http, &url).await {
            Ok(remote) => {
                deep_merge(&mut self.tree.write(), &remote);
                *self.last_sync.lock() = Some(Utc::now());
                info!("synced configuration snapshot from backend");
                self.save_cache();
            }
            Err(e) => {
                warn!("failed to fetch config from backend: {e}; falling back to cache");
                self.load_cache();
            }
        }
    }

    async fn fetch_remote(&self, http: &reqwest::Client, url: &str) -> Result<Value, AgentError> {
        let resp = http
            .get(url)
            .timeout(REMOTE_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        if body.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(AgentError::Config(format!(
                "backend returned error: {}",
                body.get("error").and_then(Value::as_str).unwrap_or("unknown")
            )));
        }
        Ok(body.get("config").cloned().unwrap_or_else(|| json!({})))
    }

    /// Gets a value by dot-notation path, e.g.
    /// `get("alerts.thresholds.cpu_critical.threshold")`.
    pub fn get(&self, key_path: &str) -> Option<Value> {
        let tree = self.tree.read();
        let mut current = &*tree;
        for key in key_path.split('.') {
            current = current.as_object()?.get(key)?;
        }
        Some(current.clone())
    }

    pub fn get_or(&self, key_path: &str, default: Value) -> Value {
        self.get(key_path).filter(|v| !v.is_null()).unwrap_or(default)
    }

    pub fn get_str(&self, key_path: &str) -> String {
        self.get(key_path)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn get_opt_str(&self, key_path: &str) -> Option<String> {
        self.get(key_path).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_u64(&self, key_path: &str, default: u64) -> u64 {
        self.get(key_path).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn get_f64(&self, key_path: &str, default: f64) -> f64 {
        self.get(key_path).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn get_bool(&self, key_path: &str, default: bool) -> bool {
        self.get(key_path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_string_list(&self, key_path: &str) -> Vec<String> {
        self.get(key_path)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sets a value by dot-notation path, creating intermediate maps as needed.
    pub fn set(&self, key_path: &str, value: Value) {
        let mut tree = self.tree.write();
        let mut current = &mut *tree;
        let keys: Vec<&str> = key_path.split('.').collect();
        for key in &keys[..keys.len() - 1] {
            if !current.is_object() {
                *current = json!({});
            }
            current = current
                .as_object_mut()
                .expect("just ensured object")
                .entry(key.to_string())
                .or_insert_with(|| json!({}));
        }
        if !current.is_object() {
            *current = json!({});
        }
        current
            .as_object_mut()
            .expect("just ensured object")
            .insert(keys[keys.len() - 1].to_string(), value.clone());
        info!("config updated: {key_path} = {value}");
    }

    pub fn get_secret(&self, name: &str) -> Option<String> {
        self.secrets
            .read()
            .get(name)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Sets a secret and persists the secrets file with owner-only permissions.
    pub fn set_secret(&self, name: &str, value: &str) -> Result<(), AgentError> {
        self.secrets.write()[name] = json!(value);
        let serialized = serde_json::to_string_pretty(&*self.secrets.read())?;
        fs::write(&self.paths.secrets_file, serialized)?;
        restrict_permissions(&self.paths.secrets_file);
        info!("secret updated: {name}");
        Ok(())
    }

    /// Persists the current tree to the local config file.
    pub fn save(&self) -> Result<(), AgentError> {
        let serialized = serde_json::to_string_pretty(&*self.tree.read())?;
        fs::write(&self.paths.config_file, serialized)?;
        info!("saved configuration to {}", self.paths.config_file.display());
        Ok(())
    }

    /// Rebuilds the tree from all layers and returns the set of changed paths.
    /// Reapplying an unchanged configuration yields an empty change set.
    pub async fn reload(&self, http: &reqwest::Client) -> ChangeSet {
        let old = self.tree.read().clone();

        *self.tree.write() = default_config();
        self.load_local();
        self.sync_remote(http).await;

        let changes = diff(&old, &self.tree.read());
        info!("configuration reloaded, {} changes detected", changes.len());
        changes
    }

    pub fn get_all(&self) -> Value {
        self.tree.read().clone()
    }

    pub fn should_sync(&self) -> bool {
        match *self.last_sync.lock() {
            None => true,
            Some(at) => Utc::now() - at > chrono::TimeDelta::from_std(REMOTE_SYNC_TTL).unwrap_or_default(),
        }
    }

    fn save_cache(&self) {
        let cache = json!({
            "config": *self.tree.read(),
            "timestamp": self.last_sync.lock().map(|t| t.to_rfc3339()),
        });
        match serde_json::to_string_pretty(&cache) {
            Ok(s) => {
                if let Err(e) = fs::write(&self.paths.cache_file, s) {
                    error!("failed to save config cache: {e}");
                } else {
                    debug!("saved config cache");
                }
            }
            Err(e) => error!("failed to serialize config cache: {e}"),
        }
    }

    fn load_cache(&self) {
        if !self.paths.cache_file.exists() {
            return;
        }
        match fs::read_to_string(&self.paths.cache_file)
            .map_err(AgentError::from)
            .and_then(|s| serde_json::from_str::<Value>(&s).map_err(AgentError::from))
        {
            Ok(cache) => {
                if let Some(cached) = cache.get("config") {
                    deep_merge(&mut self.tree.write(), cached);
                    info!("loaded configuration from cache");
                }
            }
            Err(e) => error!("failed to load config cache: {e}"),
        }
    }

    /// A machine-readable description of the configuration tree, served by
    /// `GET /api/config/schema`.
    pub fn schema() -> Value {
        json!({
            "connectivity": {
                "api_url": { "type": "string", "description": "Control-plane API base URL" },
                "telemetry_backend_url": { "type": "string", "description": "Telemetry backend base URL" },
            },
            "messaging": {
                "bus": {
                    "url": { "type": "string", "description": "Message bus server URL" },
                    "subject": { "type": "string", "description": "Subject error events are published to" },
                }
            },
            "telemetry": {
                "retry_backoff": { "type": "array", "items": "integer", "description": "Backoff series in seconds for transient POST failures" },
                "timeout": { "type": "integer", "description": "Snapshot POST timeout in seconds" },
                "queue_db_path": { "type": "string", "description": "Telemetry queue database file (relative to the config dir)" },
                "queue_max_size": { "type": "integer", "description": "Maximum queued snapshots before oldest-drop" },
                "post_interval": { "type": "integer", "description": "Seconds between queue flush cycles" },
                "post_batch_size": { "type": "integer", "description": "Snapshots posted per flush cycle" },
                "max_retries": { "type": "integer", "description": "Transient retries before a snapshot is dropped" },
            },
            "monitoring": {
                "log_files": { "type": "array", "items": "object", "description": "Monitored log sources" },
                "error_keywords": { "type": "array", "items": "string", "hot_reload": true },
                "priority_keywords": { "type": "object", "hot_reload": true },
            },
            "alerts": {
                "thresholds": { "type": "object", "hot_reload": true, "description": "Per alert-kind threshold/duration/priority/cooldown" },
            },
            "ports": {
                "control": { "type": "integer" },
                "livelogs": { "type": "integer" },
                "telemetry_ws": { "type": "integer" },
            },
            "intervals": {
                "telemetry": { "type": "integer", "restart_required": "sampler" },
                "heartbeat": { "type": "integer", "restart_required": "heartbeat" },
            },
            "logging": {
                "level": { "type": "string", "hot_reload": true },
                "path": { "type": "string" },
            },
            "suppression": {
                "db_path": { "type": "string" },
                "cache_ttl": { "type": "integer" },
            },
            "node": {
                "id": { "type": "string", "description": "Node identifier override; autodetected when null" },
            },
        })
    }
}

/// Deep-merges `updates` into `base`. Non-object values (arrays included)
/// replace wholesale.
pub fn deep_merge(base: &mut Value, updates: &Value) {
    if let (Some(base_map), Some(update_map)) = (base.as_object_mut(), updates.as_object()) {
        for (key, value) in update_map {
            match base_map.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    deep_merge(existing, value);
                }
                _ => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *base = updates.clone();
    }
}

/// Computes a dot-path diff between two trees, including additions and removals.
pub fn diff(old: &Value, new: &Value) -> ChangeSet {
    let mut changes = ChangeSet::new();
    diff_inner(old, new, "", &mut changes);
    changes
}

fn diff_inner(old: &Value, new: &Value, path: &str, changes: &mut ChangeSet) {
    let (Some(old_map), Some(new_map)) = (old.as_object(), new.as_object()) else {
        if old != new {
            changes.insert(path.to_string(), (old.clone(), new.clone()));
        }
        return;
    };

    for (key, new_value) in new_map {
        let current = join_path(path, key);
        match old_map.get(key) {
            None => {
                changes.insert(current, (Value::Null, new_value.clone()));
            }
            Some(old_value) if old_value != new_value => {
                if old_value.is_object() && new_value.is_object() {
                    diff_inner(old_value, new_value, &current, changes);
                } else {
                    changes.insert(current, (old_value.clone(), new_value.clone()));
                }
            }
            Some(_) => {}
        }
    }

    for (key, old_value) in old_map {
        if !new_map.contains_key(key) {
            changes.insert(join_path(path, key), (old_value.clone(), Value::Null));
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("could not restrict permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
