//! In-memory storage backend.
//!
//! Backs tests and ephemeral embedders; same quota and TTL behavior as the
//! durable backends, nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use trikgate_manifest::StorageCapabilities;

use crate::error::{Error, Result};
use crate::{max_size_from, now_ms, value_size, StorageContext, StorageEntry, StorageProvider};

pub struct MemoryStorageContext {
    entries: Mutex<HashMap<String, StorageEntry>>,
    max_size_bytes: u64,
}

impl MemoryStorageContext {
    pub fn new(max_size_bytes: u64) -> Self {
        Self { entries: Mutex::new(HashMap::new()), max_size_bytes }
    }
}

fn usage_of(entries: &HashMap<String, StorageEntry>, now: i64) -> u64 {
    entries
        .values()
        .filter(|e| !e.is_expired(now))
        .map(|e| value_size(&e.value))
        .sum()
}

fn check_quota(
    entries: &HashMap<String, StorageEntry>,
    writes: &BTreeMap<String, Value>,
    max: u64,
    now: i64,
) -> Result<()> {
    let used = usage_of(entries, now);
    let reclaimed: u64 = writes
        .keys()
        .filter_map(|k| entries.get(k))
        .filter(|e| !e.is_expired(now))
        .map(|e| value_size(&e.value))
        .sum();
    let adding: u64 = writes.values().map(value_size).sum();

    if used.saturating_sub(reclaimed) + adding > max {
        return Err(Error::quota_exceeded(used, adding, max));
    }
    Ok(())
}

#[async_trait]
impl StorageContext for MemoryStorageContext {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        let now = now_ms();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> Result<()> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        let now = now_ms();
        let used = usage_of(&entries, now);
        let reclaimed = entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| value_size(&e.value))
            .unwrap_or(0);
        let adding = value_size(&value);
        if used.saturating_sub(reclaimed) + adding > self.max_size_bytes {
            return Err(Error::quota_exceeded(used, adding, self.max_size_bytes));
        }
        entries.insert(key.to_string(), StorageEntry::new(value, ttl_ms));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        let now = now_ms();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        let now = now_ms();
        entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
            .cloned()
            .collect();
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
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        check_quota(&entries, &writes, self.max_size_bytes, now_ms())?;
        for (key, value) in writes {
            entries.insert(key, StorageEntry::new(value, None));
        }
        Ok(())
    }

    async fn usage(&self) -> Result<u64> {
        let entries = self.entries.lock().expect("storage lock poisoned");
        Ok(usage_of(&entries, now_ms()))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().expect("storage lock poisoned").clear();
        Ok(())
    }
}

/// Provider handing out one in-memory context per trik id.
#[derive(Default)]
pub struct MemoryStorageProvider {
    contexts: Mutex<HashMap<String, Arc<MemoryStorageContext>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self, trik_id: &str) -> Option<Arc<MemoryStorageContext>> {
        self.contexts.lock().expect("provider lock poisoned").get(trik_id).cloned()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn for_trik(
        &self,
        trik_id: &str,
        capabilities: Option<&StorageCapabilities>,
    ) -> Result<Arc<dyn StorageContext>> {
        let mut contexts = self.contexts.lock().expect("provider lock poisoned");
        let context = contexts
            .entry(trik_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStorageContext::new(max_size_from(capabilities))));
        Ok(Arc::clone(context) as Arc<dyn StorageContext>)
    }

    async fn usage(&self, trik_id: &str) -> Result<u64> {
        match self.context(trik_id) {
            Some(context) => context.usage().await,
            None => Ok(0),
        }
    }

    async fn clear(&self, trik_id: &str) -> Result<()> {
        if let Some(context) = self.context(trik_id) {
            context.clear().await?;
        }
        Ok(())
    }

    async fn list_triks(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> =
            self.contexts.lock().expect("provider lock poisoned").keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
