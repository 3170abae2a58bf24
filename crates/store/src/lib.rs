//! Persistent per-trik key-value storage with TTL and quota enforcement.
//!
//! Each trik gets an isolated namespace addressed by its manifest id. A
//! [`StorageProvider`] hands out one [`StorageContext`] per trik and caches
//! it, so repeated lookups observe the same backing state. Three backends
//! share the same semantics: a JSON-file backend (one file per trik, writes
//! debounced), a SQLite backend (one database for all triks), and an
//! in-memory backend for tests and ephemeral embedders.
//!
//! Quota is measured in serialized-JSON bytes of the stored values.
//! Overwriting a key reclaims the old value's size first, so an exact-fit
//! write always succeeds. Expired entries are reaped lazily: `get` drops an
//! expired entry on read, `list` sweeps the whole namespace.

mod error;
mod file;
mod memory;
mod schema;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trikgate_manifest::StorageCapabilities;

pub use error::{Error, Result};
pub use file::{FileStorageProvider, JsonFileStorageContext};
pub use memory::{MemoryStorageContext, MemoryStorageProvider};
pub use sqlite::{SqliteStorageContext, SqliteStorageProvider};

/// One stored value with its lifecycle timestamps (epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub value: Value,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StorageEntry {
    pub fn new(value: Value, ttl_ms: Option<u64>) -> Self {
        let now = now_ms();
        Self { value, created_at: now, expires_at: ttl_ms.map(|ttl| now + ttl as i64) }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key-value storage scoped to a single trik.
#[async_trait]
pub trait StorageContext: Send + Sync {
    /// Get a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, optionally expiring after `ttl_ms` milliseconds.
    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> Result<()>;

    /// Delete a key; returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List live keys, optionally filtered by prefix, in sorted order.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Fetch several keys at once; absent and expired keys are omitted.
    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Value>>;

    /// Store several values with no TTL, atomically against the quota.
    async fn set_many(&self, entries: BTreeMap<String, Value>) -> Result<()>;

    /// Current usage in serialized-value bytes, excluding expired entries.
    async fn usage(&self) -> Result<u64>;

    /// Remove every entry for this trik.
    async fn clear(&self) -> Result<()>;
}

/// Factory and registry for per-trik storage contexts.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the context for `trik_id`, creating it on first use.
    ///
    /// Capabilities are only consulted on the creating call; later calls
    /// return the cached context unchanged.
    async fn for_trik(
        &self,
        trik_id: &str,
        capabilities: Option<&StorageCapabilities>,
    ) -> Result<Arc<dyn StorageContext>>;

    /// Usage in bytes for a trik, without binding a context permanently.
    async fn usage(&self, trik_id: &str) -> Result<u64>;

    /// Drop all data stored for a trik.
    async fn clear(&self, trik_id: &str) -> Result<()>;

    /// Ids of every trik with stored data.
    async fn list_triks(&self) -> Result<Vec<String>>;
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Serialized size of a value, the unit the quota is charged in.
pub(crate) fn value_size(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
}

pub(crate) fn max_size_from(capabilities: Option<&StorageCapabilities>) -> u64 {
    capabilities
        .map(StorageCapabilities::max_size_bytes)
        .unwrap_or(trikgate_manifest::DEFAULT_MAX_SIZE_BYTES)
}
