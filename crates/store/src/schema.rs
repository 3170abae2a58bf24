//! SQLite schema for the trik storage backend.

/// Current schema version
#[allow(dead_code)]
pub const SCHEMA_VERSION: i32 = 1;

/// Connection pragmas applied on open
///
/// WAL keeps readers unblocked while the gateway writes; the busy timeout
/// covers embedders sharing the database across processes.
pub const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
"#;

/// SQL to create the storage table and its indexes
///
/// Values are stored as serialized JSON text. The quota is charged in
/// UTF-8 bytes, so size queries use LENGTH(CAST(value AS BLOB)); LENGTH
/// on the TEXT column would count characters. Timestamps are epoch
/// milliseconds; a NULL expires_at means the entry never expires.
pub const TRIK_STORAGE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trik_storage (
    trik_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    UNIQUE(trik_id, key)
);

CREATE INDEX IF NOT EXISTS idx_trik_storage_trik
ON trik_storage(trik_id);

CREATE INDEX IF NOT EXISTS idx_trik_storage_expiry
ON trik_storage(expires_at);
"#;
