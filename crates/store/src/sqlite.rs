//! SQLite storage backend.
//!
//! One database holds every trik's namespace, which makes it the backend of
//! choice when several triks (or several gateway processes) share storage.
//! All access goes through a single `tokio_rusqlite` connection; statements
//! are cached per connection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tokio_rusqlite::Connection;
use tracing::instrument;
use trikgate_manifest::StorageCapabilities;

use crate::error::{Error, Result};
use crate::{max_size_from, now_ms, schema, StorageContext, StorageProvider};

const LIVE_FILTER: &str = "(expires_at IS NULL OR expires_at > ?)";

/// Storage namespace for one trik inside the shared database.
pub struct SqliteStorageContext {
    conn: Arc<Connection>,
    trik_id: String,
    max_size_bytes: u64,
}

async fn usage_for(conn: &Connection, trik_id: &str) -> Result<u64> {
    let trik_id = trik_id.to_owned();
    let now = now_ms();
    let usage = conn
        .call(move |conn| {
            // LENGTH on TEXT counts characters; cast to BLOB for bytes.
            let mut stmt = conn.prepare_cached(
                "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM trik_storage
                 WHERE trik_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )?;
            let usage: i64 = stmt.query_row(params![&trik_id, now], |row| row.get(0))?;
            Ok::<_, rusqlite::Error>(usage)
        })
        .await?;
    Ok(usage.max(0) as u64)
}

async fn clear_for(conn: &Connection, trik_id: &str) -> Result<()> {
    let trik_id = trik_id.to_owned();
    conn.call(move |conn| {
        let mut stmt = conn.prepare_cached("DELETE FROM trik_storage WHERE trik_id = ?1")?;
        stmt.execute(params![&trik_id])?;
        Ok::<_, rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

impl SqliteStorageContext {
    /// Live serialized size of the value at `key`, if any.
    async fn existing_size(&self, key: &str) -> Result<u64> {
        let trik_id = self.trik_id.clone();
        let key = key.to_owned();
        let now = now_ms();
        let size = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT LENGTH(CAST(value AS BLOB)) FROM trik_storage
                     WHERE trik_id = ?1 AND key = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                )?;
                let size: Option<i64> = stmt
                    .query_row(params![&trik_id, &key, now], |row| row.get(0))
                    .optional()?;
                Ok::<_, rusqlite::Error>(size.unwrap_or(0))
            })
            .await?;
        Ok(size.max(0) as u64)
    }

    async fn check_quota(&self, reclaimed: u64, adding: u64) -> Result<()> {
        let used = usage_for(&self.conn, &self.trik_id).await?;
        if used.saturating_sub(reclaimed) + adding > self.max_size_bytes {
            return Err(Error::quota_exceeded(used, adding, self.max_size_bytes));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageContext for SqliteStorageContext {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let trik_id = self.trik_id.clone();
        let key = key.to_owned();
        let now = now_ms();
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT value, expires_at FROM trik_storage WHERE trik_id = ?1 AND key = ?2",
                )?;
                let row: Option<(String, Option<i64>)> = stmt
                    .query_row(params![&trik_id, &key], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?;

                match row {
                    Some((_, Some(expires_at))) if expires_at <= now => {
                        let mut del = conn.prepare_cached(
                            "DELETE FROM trik_storage WHERE trik_id = ?1 AND key = ?2",
                        )?;
                        del.execute(params![&trik_id, &key])?;
                        Ok::<_, rusqlite::Error>(None)
                    }
                    Some((value, _)) => Ok(Some(value)),
                    None => Ok(None),
                }
            })
            .await?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value), fields(trik_id = %self.trik_id, key))]
    async fn set(&self, key: &str, value: Value, ttl_ms: Option<u64>) -> Result<()> {
        let serialized = serde_json::to_string(&value)?;
        let reclaimed = self.existing_size(key).await?;
        self.check_quota(reclaimed, serialized.len() as u64).await?;

        let trik_id = self.trik_id.clone();
        let key = key.to_owned();
        let now = now_ms();
        let expires_at = ttl_ms.map(|ttl| now + ttl as i64);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO trik_storage (trik_id, key, value, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (trik_id, key) DO UPDATE SET
                         value = excluded.value,
                         created_at = excluded.created_at,
                         expires_at = excluded.expires_at",
                )?;
                stmt.execute(params![&trik_id, &key, &serialized, now, expires_at])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let trik_id = self.trik_id.clone();
        let key = key.to_owned();
        let now = now_ms();
        let was_live = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT expires_at FROM trik_storage WHERE trik_id = ?1 AND key = ?2",
                )?;
                let row: Option<Option<i64>> = stmt
                    .query_row(params![&trik_id, &key], |row| row.get(0))
                    .optional()?;

                let mut del = conn
                    .prepare_cached("DELETE FROM trik_storage WHERE trik_id = ?1 AND key = ?2")?;
                del.execute(params![&trik_id, &key])?;

                let was_live = match row {
                    Some(Some(expires_at)) => expires_at > now,
                    Some(None) => true,
                    None => false,
                };
                Ok::<_, rusqlite::Error>(was_live)
            })
            .await?;
        Ok(was_live)
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let trik_id = self.trik_id.clone();
        let prefix = prefix.map(str::to_owned);
        let now = now_ms();
        let keys = self
            .conn
            .call(move |conn| {
                // Lazy sweep: drop everything expired in this namespace first.
                let mut sweep = conn.prepare_cached(
                    "DELETE FROM trik_storage
                     WHERE trik_id = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                )?;
                sweep.execute(params![&trik_id, now])?;

                let mut stmt = conn.prepare_cached(
                    "SELECT key FROM trik_storage WHERE trik_id = ?1 ORDER BY key",
                )?;
                let keys = stmt
                    .query_map(params![&trik_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(keys)
            })
            .await?;

        Ok(match prefix {
            Some(p) => keys.into_iter().filter(|k| k.starts_with(&p)).collect(),
            None => keys,
        })
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
        let mut serialized = Vec::with_capacity(writes.len());
        let mut reclaimed = 0u64;
        let mut adding = 0u64;
        for (key, value) in &writes {
            let text = serde_json::to_string(value)?;
            reclaimed += self.existing_size(key).await?;
            adding += text.len() as u64;
            serialized.push((key.clone(), text));
        }
        self.check_quota(reclaimed, adding).await?;

        let trik_id = self.trik_id.clone();
        let now = now_ms();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO trik_storage (trik_id, key, value, created_at, expires_at)
                         VALUES (?1, ?2, ?3, ?4, NULL)
                         ON CONFLICT (trik_id, key) DO UPDATE SET
                             value = excluded.value,
                             created_at = excluded.created_at,
                             expires_at = excluded.expires_at",
                    )?;
                    for (key, text) in &serialized {
                        stmt.execute(params![&trik_id, key, text, now])?;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn usage(&self) -> Result<u64> {
        usage_for(&self.conn, &self.trik_id).await
    }

    async fn clear(&self) -> Result<()> {
        clear_for(&self.conn, &self.trik_id).await
    }
}

/// Provider backed by one SQLite database for all triks.
pub struct SqliteStorageProvider {
    conn: Arc<Connection>,
    contexts: Mutex<HashMap<String, Arc<SqliteStorageContext>>>,
}

impl SqliteStorageProvider {
    /// Open or create the storage database at the given path.
    #[instrument(skip_all, fields(db_path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .await
            .map_err(|e| Error::database(format!("Failed to open database: {e}")))?;
        Self::init(conn).await
    }

    /// Open a transient in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::database(format!("Failed to open database: {e}")))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(schema::PRAGMAS_SQL)?;
            conn.execute_batch(schema::TRIK_STORAGE_SQL)?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .map_err(|e| Error::database(format!("Schema setup failed: {e}")))?;

        tracing::debug!("trik storage database ready");
        Ok(Self { conn: Arc::new(conn), contexts: Mutex::new(HashMap::new()) })
    }
}

#[async_trait]
impl StorageProvider for SqliteStorageProvider {
    async fn for_trik(
        &self,
        trik_id: &str,
        capabilities: Option<&StorageCapabilities>,
    ) -> Result<Arc<dyn StorageContext>> {
        let mut contexts = self.contexts.lock().expect("provider lock poisoned");
        let context = contexts.entry(trik_id.to_string()).or_insert_with(|| {
            Arc::new(SqliteStorageContext {
                conn: Arc::clone(&self.conn),
                trik_id: trik_id.to_string(),
                max_size_bytes: max_size_from(capabilities),
            })
        });
        Ok(Arc::clone(context) as Arc<dyn StorageContext>)
    }

    async fn usage(&self, trik_id: &str) -> Result<u64> {
        usage_for(&self.conn, trik_id).await
    }

    async fn clear(&self, trik_id: &str) -> Result<()> {
        clear_for(&self.conn, trik_id).await
    }

    async fn list_triks(&self) -> Result<Vec<String>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare_cached("SELECT DISTINCT trik_id FROM trik_storage ORDER BY trik_id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(ids)
            })
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn provider() -> SqliteStorageProvider {
        SqliteStorageProvider::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let provider = provider().await;
        let ctx = provider.for_trik("@demo/notes", None).await.unwrap();
        ctx.set("note", json!({"title": "hello"}), None).await.unwrap();
        assert_eq!(ctx.get("note").await.unwrap(), Some(json!({"title": "hello"})));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let provider = provider().await;
        let a = provider.for_trik("@demo/a", None).await.unwrap();
        let b = provider.for_trik("@demo/b", None).await.unwrap();
        a.set("k", json!(1), None).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), None);
        assert_eq!(provider.list_triks().await.unwrap(), vec!["@demo/a"]);
    }

    #[tokio::test]
    async fn test_expired_entry_deleted_on_get() {
        let provider = provider().await;
        let ctx = provider.for_trik("@demo/ttl", None).await.unwrap();
        ctx.set("ephemeral", json!("x"), Some(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ctx.get("ephemeral").await.unwrap(), None);
        assert_eq!(ctx.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_sweeps_expired() {
        let provider = provider().await;
        let ctx = provider.for_trik("@demo/ttl", None).await.unwrap();
        ctx.set("gone", json!("x"), Some(10)).await.unwrap();
        ctx.set("kept", json!("y"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ctx.list(None).await.unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        use trikgate_manifest::StorageCapabilities;

        let provider = provider().await;
        let caps: StorageCapabilities =
            serde_json::from_value(json!({"enabled": true, "maxSizeBytes": 12})).unwrap();
        let ctx = provider.for_trik("@demo/tiny", Some(&caps)).await.unwrap();

        // Exactly 12 serialized bytes fits.
        ctx.set("k", json!("0123456789"), None).await.unwrap();
        let err = ctx.set("other", json!("z"), None).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // Overwriting the same key reclaims the old size first.
        ctx.set("k", json!("abcdefghij"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_counts_bytes_not_characters() {
        use trikgate_manifest::StorageCapabilities;

        let provider = provider().await;
        let caps: StorageCapabilities =
            serde_json::from_value(json!({"enabled": true, "maxSizeBytes": 12})).unwrap();
        let ctx = provider.for_trik("@demo/tiny", Some(&caps)).await.unwrap();

        // Five two-byte characters serialize to 12 bytes (7 characters).
        ctx.set("k", json!("ééééé"), None).await.unwrap();
        assert_eq!(ctx.usage().await.unwrap(), 12);

        // The quota is full in bytes even though a character count
        // would admit more.
        let err = ctx.set("other", json!("z"), None).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { used: 12, adding: 3, max: 12 }));
    }

    #[tokio::test]
    async fn test_delete_returns_liveness() {
        let provider = provider().await;
        let ctx = provider.for_trik("@demo/notes", None).await.unwrap();
        ctx.set("k", json!(1), None).await.unwrap();
        assert!(ctx.delete("k").await.unwrap());
        assert!(!ctx.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_provider_usage_and_clear() {
        let provider = provider().await;
        let ctx = provider.for_trik("@demo/notes", None).await.unwrap();
        ctx.set("k", json!("0123456789"), None).await.unwrap();
        assert_eq!(provider.usage("@demo/notes").await.unwrap(), 12);
        provider.clear("@demo/notes").await.unwrap();
        assert_eq!(provider.usage("@demo/notes").await.unwrap(), 0);
        assert_eq!(ctx.get("k").await.unwrap(), None);
    }
}
