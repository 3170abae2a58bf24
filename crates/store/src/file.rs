//! JSON-file storage backend.
//!
//! One file per trik at `<base>/@<trik-id>/data.json`, loaded lazily on
//! first access and written back through a short debounce so bursts of
//! writes coalesce into one flush. A corrupt or missing file degrades to an
//! empty namespace. The gateway guarantees a single writer per trik file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::instrument;
use trikgate_manifest::StorageCapabilities;

use crate::error::{Error, Result};
use crate::{max_size_from, now_ms, value_size, StorageContext, StorageEntry, StorageProvider};

const FLUSH_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileDocument {
    version: u32,
    trik_id: String,
    entries: HashMap<String, StorageEntry>,
}

#[derive(Default)]
struct FileState {
    entries: HashMap<String, StorageEntry>,
    loaded: bool,
}

pub struct JsonFileStorageContext {
    path: PathBuf,
    trik_id: String,
    max_size_bytes: u64,
    state: Arc<Mutex<FileState>>,
    flush_scheduled: Arc<AtomicBool>,
}

impl JsonFileStorageContext {
    pub fn new(path: PathBuf, trik_id: impl Into<String>, max_size_bytes: u64) -> Self {
        Self {
            path,
            trik_id: trik_id.into(),
            max_size_bytes,
            state: Arc::new(Mutex::new(FileState::default())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn ensure_loaded(&self, state: &mut FileState) {
        if state.loaded {
            return;
        }
        state.loaded = true;

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<FileDocument>(&bytes) {
                Ok(doc) => state.entries = doc.entries,
                Err(e) => {
                    tracing::warn!(
                        trik_id = %self.trik_id,
                        path = %self.path.display(),
                        "corrupt storage file, starting empty: {e}"
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    trik_id = %self.trik_id,
                    path = %self.path.display(),
                    "unreadable storage file, starting empty: {e}"
                );
            }
        }
    }

    fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        let flush_scheduled = Arc::clone(&self.flush_scheduled);
        let path = self.path.clone();
        let trik_id = self.trik_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            flush_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = write_document(&path, &trik_id, &state).await {
                tracing::error!(trik_id, path = %path.display(), "storage flush failed: {e}");
            }
        });
    }

    /// Flush pending writes immediately. Used at shutdown and in tests.
    pub async fn force_flush(&self) -> Result<()> {
        write_document(&self.path, &self.trik_id, &self.state).await
    }
}

async fn write_document(
    path: &Path,
    trik_id: &str,
    state: &Mutex<FileState>,
) -> Result<()> {
    let doc = {
        let state = state.lock().await;
        FileDocument {
            version: 1,
            trik_id: trik_id.to_string(),
            entries: state.entries.clone(),
        }
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(&doc)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn usage_of(entries: &HashMap<String, StorageEntry>, now: i64) -> u64 {
    entries
        .values()
        .filter(|e| !e.is_expired(now))
        .map(|e| value_size(&e.value))
        .sum()
}

#[async_trait]
impl StorageContext for JsonFileStorageContext {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        let now = now_ms();
        match state.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                state.entries.remove(key);
                drop(state);
                self.schedule_flush();
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value), fields(trik_id = %self.trik_id, key))]
    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let now = now_ms();
        let used = usage_of(&state.entries, now);
        let reclaimed = state
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| value_size(&e.value))
            .unwrap_or(0);
        let adding = value_size(&value);
        if used.saturating_sub(reclaimed) + adding > self.max_size_bytes {
            return Err(Error::quota_exceeded(used, adding, self.max_size_bytes));
        }

        state.entries.insert(key.to_string(), StorageEntry::new(value, ttl_ms));
        drop(state);
        self.schedule_flush();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        let now = now_ms();
        let removed = state.entries.remove(key);
        drop(state);
        match removed {
            Some(entry) => {
                self.schedule_flush();
                Ok(!entry.is_expired(now))
            }
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        let now = now_ms();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let swept = state.entries.len() < before;

        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
            .cloned()
            .collect();
        drop(state);
        if swept {
            self.schedule_flush();
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    async fn set_many(&self, writes: BTreeMap<String, Value>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;

        let now = now_ms();
        let used = usage_of(&state.entries, now);
        let reclaimed: u64 = writes
            .keys()
            .filter_map(|k| state.entries.get(k))
            .filter(|e| !e.is_expired(now))
            .map(|e| value_size(&e.value))
            .sum();
        let adding: u64 = writes.values().map(value_size).sum();
        if used.saturating_sub(reclaimed) + adding > self.max_size_bytes {
            return Err(Error::quota_exceeded(used, adding, self.max_size_bytes));
        }

        for (key, value) in writes {
            state.entries.insert(key, StorageEntry::new(value, None));
        }
        drop(state);
        self.schedule_flush();
        Ok(())
    }

    async fn usage(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        Ok(usage_of(&state.entries, now_ms()))
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await;
        state.entries.clear();
        drop(state);
        self.schedule_flush();
        Ok(())
    }
}

/// Provider laying triks out as `<base>/@<trik-id>/data.json`.
pub struct FileStorageProvider {
    base_dir: PathBuf,
    contexts: std::sync::Mutex<HashMap<String, Arc<JsonFileStorageContext>>>,
}

impl FileStorageProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), contexts: std::sync::Mutex::new(HashMap::new()) }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, trik_id: &str) -> PathBuf {
        let normalized = trik_id.trim_start_matches('@');
        self.base_dir.join(format!("@{normalized}")).join("data.json")
    }

    fn cached(&self, trik_id: &str) -> Option<Arc<JsonFileStorageContext>> {
        self.contexts.lock().expect("provider lock poisoned").get(trik_id).cloned()
    }

    /// Flush every bound context. Called at gateway shutdown.
    pub async fn flush_all(&self) -> Result<()> {
        let contexts: Vec<Arc<JsonFileStorageContext>> = {
            let map = self.contexts.lock().expect("provider lock poisoned");
            map.values().cloned().collect()
        };
        for context in contexts {
            context.force_flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for FileStorageProvider {
    async fn for_trik(
        &self,
        trik_id: &str,
        capabilities: Option<&StorageCapabilities>,
    ) -> Result<Arc<dyn StorageContext>> {
        let mut contexts = self.contexts.lock().expect("provider lock poisoned");
        let context = contexts.entry(trik_id.to_string()).or_insert_with(|| {
            Arc::new(JsonFileStorageContext::new(
                self.file_path(trik_id),
                trik_id,
                max_size_from(capabilities),
            ))
        });
        Ok(Arc::clone(context) as Arc<dyn StorageContext>)
    }

    async fn usage(&self, trik_id: &str) -> Result<u64> {
        if let Some(context) = self.cached(trik_id) {
            return context.usage().await;
        }
        // Unbound trik: read the document and charge live values only,
        // the same metric a bound context reports.
        match tokio::fs::read(self.file_path(trik_id)).await {
            Ok(bytes) => {
                let doc: FileDocument = serde_json::from_slice(&bytes).unwrap_or_default();
                Ok(usage_of(&doc.entries, now_ms()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, trik_id: &str) -> Result<()> {
        if let Some(context) = self.cached(trik_id) {
            context.clear().await?;
            context.force_flush().await?;
            return Ok(());
        }
        match tokio::fs::remove_file(self.file_path(trik_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_triks(&self) -> Result<Vec<String>> {
        let mut triks = Vec::new();
        let mut base = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(triks),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = base.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('@') {
                // Scoped layout: @scope/name/data.json
                let mut scope = tokio::fs::read_dir(entry.path()).await?;
                while let Some(scoped) = scope.next_entry().await? {
                    if scoped.file_type().await?.is_dir()
                        && scoped.path().join("data.json").is_file()
                    {
                        triks.push(format!("{name}/{}", scoped.file_name().to_string_lossy()));
                    }
                }
            } else if entry.path().join("data.json").is_file() {
                triks.push(name);
            }
        }

        triks.sort();
        Ok(triks)
    }
}
