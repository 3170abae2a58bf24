//! Configuration (API keys, tokens) for triks.
//!
//! Secrets live outside the trik package, keyed by trik id: a global file at
//! `~/.trikhub/secrets.json` and an optional per-project file at
//! `./.trikhub/secrets.json`. The local file wins key-by-key. Triks only
//! ever see the merged, read-only [`ConfigContext`] for their own id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use trikgate_manifest::TrikManifest;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `get_for_trik` was called before `load()`
    #[error("config store not loaded, call load() first")]
    NotLoaded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

type SecretsMap = BTreeMap<String, BTreeMap<String, String>>;

/// Read-only view of the config values a trik may see.
///
/// Explicit values shadow manifest-declared defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigContext {
    values: BTreeMap<String, String>,
    defaults: BTreeMap<String, String>,
}

impl ConfigContext {
    pub fn new(values: BTreeMap<String, String>, defaults: BTreeMap<String, String>) -> Self {
        Self { values, defaults }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .or_else(|| self.defaults.get(key))
            .map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key) || self.defaults.contains_key(key)
    }

    /// Configured keys, without values.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> =
            self.values.keys().chain(self.defaults.keys()).cloned().collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Flatten to the plain map sent across the worker wire.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.defaults.clone();
        map.extend(self.values.clone());
        map
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.defaults.is_empty()
    }
}

/// Store of per-trik configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load secrets. Must be called before `get_for_trik`.
    async fn load(&self) -> Result<()>;

    /// Drop cached secrets and re-read them.
    async fn reload(&self) -> Result<()>;

    /// Config context scoped to one trik.
    fn get_for_trik(&self, trik_id: &str) -> Result<ConfigContext>;

    /// Missing required keys for a manifest; empty when fully configured.
    fn validate_config(&self, manifest: &TrikManifest) -> Result<Vec<String>>;

    /// All trik ids with any configuration.
    fn configured_triks(&self) -> Vec<String>;
}

fn missing_required_keys(manifest: &TrikManifest, context: &ConfigContext) -> Vec<String> {
    manifest
        .config
        .as_ref()
        .and_then(|c| c.required.as_ref())
        .map(|required| {
            required
                .iter()
                .filter(|req| !context.has(&req.key))
                .map(|req| req.key.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct FileSecretsState {
    global: SecretsMap,
    local: SecretsMap,
    loaded: bool,
}

/// File-backed config store over the global and local secrets files.
pub struct FileConfigStore {
    global_path: PathBuf,
    local_path: PathBuf,
    allow_local_override: bool,
    state: Mutex<FileSecretsState>,
}

impl FileConfigStore {
    /// Store over the default paths: `~/.trikhub/secrets.json` and
    /// `./.trikhub/secrets.json`.
    pub fn new() -> Self {
        let global = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".trikhub")
            .join("secrets.json");
        let local = PathBuf::from(".trikhub").join("secrets.json");
        Self::with_paths(global, local)
    }

    pub fn with_paths(global_path: impl Into<PathBuf>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            global_path: global_path.into(),
            local_path: local_path.into(),
            allow_local_override: true,
            state: Mutex::new(FileSecretsState::default()),
        }
    }

    pub fn without_local_override(mut self) -> Self {
        self.allow_local_override = false;
        self
    }

    /// The paths in use, for diagnostics.
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.global_path, &self.local_path)
    }

    async fn read_secrets_file(path: &Path) -> SecretsMap {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(secrets) => secrets,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "unparseable secrets file: {e}");
                    SecretsMap::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SecretsMap::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable secrets file: {e}");
                SecretsMap::default()
            }
        }
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> Result<()> {
        let global = Self::read_secrets_file(&self.global_path).await;
        let local = if self.allow_local_override {
            Self::read_secrets_file(&self.local_path).await
        } else {
            SecretsMap::default()
        };

        let mut state = self.state.lock().expect("config lock poisoned");
        state.global = global;
        state.local = local;
        state.loaded = true;
        tracing::debug!(
            global = %self.global_path.display(),
            local = %self.local_path.display(),
            "secrets loaded"
        );
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("config lock poisoned");
            *state = FileSecretsState::default();
        }
        self.load().await
    }

    fn get_for_trik(&self, trik_id: &str) -> Result<ConfigContext> {
        let state = self.state.lock().expect("config lock poisoned");
        if !state.loaded {
            return Err(ConfigError::NotLoaded);
        }

        let mut merged = state.global.get(trik_id).cloned().unwrap_or_default();
        if self.allow_local_override {
            if let Some(local) = state.local.get(trik_id) {
                merged.extend(local.clone());
            }
        }
        Ok(ConfigContext::new(merged, BTreeMap::new()))
    }

    fn validate_config(&self, manifest: &TrikManifest) -> Result<Vec<String>> {
        let context = self.get_for_trik(&manifest.id)?;
        Ok(missing_required_keys(manifest, &context))
    }

    fn configured_triks(&self) -> Vec<String> {
        let state = self.state.lock().expect("config lock poisoned");
        let mut ids: Vec<String> =
            state.global.keys().chain(state.local.keys()).cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// In-memory config store for tests and programmatic embedding.
#[derive(Default)]
pub struct InMemoryConfigStore {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    secrets: SecretsMap,
    defaults: SecretsMap,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_for_trik(&self, trik_id: &str, config: BTreeMap<String, String>) {
        let mut state = self.state.lock().expect("config lock poisoned");
        state.secrets.insert(trik_id.to_string(), config);
    }

    /// Seed defaults from a manifest's optional config declarations.
    pub fn set_defaults_from_manifest(&self, manifest: &TrikManifest) {
        let defaults = manifest.config_defaults();
        if defaults.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("config lock poisoned");
        state.defaults.insert(manifest.id.clone(), defaults);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("config lock poisoned");
        *state = InMemoryState::default();
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    fn get_for_trik(&self, trik_id: &str) -> Result<ConfigContext> {
        let state = self.state.lock().expect("config lock poisoned");
        Ok(ConfigContext::new(
            state.secrets.get(trik_id).cloned().unwrap_or_default(),
            state.defaults.get(trik_id).cloned().unwrap_or_default(),
        ))
    }

    fn validate_config(&self, manifest: &TrikManifest) -> Result<Vec<String>> {
        let context = self.get_for_trik(&manifest.id)?;
        Ok(missing_required_keys(manifest, &context))
    }

    fn configured_triks(&self) -> Vec<String> {
        let state = self.state.lock().expect("config lock poisoned");
        state.secrets.keys().cloned().collect()
    }
}
