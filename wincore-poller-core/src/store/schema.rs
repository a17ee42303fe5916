//! Database schema for the poller database.
//!
//! The version lives in `PRAGMA user_version`. Bump [`SCHEMA_VERSION`] and add a
//! migration to [`MIGRATIONS`] when tables change.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS polling_targets (
    component_id INTEGER NOT NULL,
    branch_id INTEGER NOT NULL,
    component_guid TEXT NOT NULL,
    component_name TEXT NOT NULL,
    project_key TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    polling_interval_secs INTEGER NOT NULL DEFAULT 300,
    enabled INTEGER NOT NULL DEFAULT 1,
    url_pattern TEXT,
    PRIMARY KEY (component_id, branch_id)
);

CREATE TABLE IF NOT EXISTS build_tracking (
    component_id INTEGER NOT NULL,
    branch_id INTEGER NOT NULL,
    build_date TEXT NOT NULL,
    build_number INTEGER NOT NULL,
    download_status TEXT NOT NULL,
    extraction_status TEXT NOT NULL,
    download_path TEXT,
    extraction_path TEXT,
    last_error TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (component_id, branch_id)
);

CREATE TABLE IF NOT EXISTS build_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    component_id INTEGER NOT NULL,
    branch_id INTEGER NOT NULL,
    build_date TEXT NOT NULL,
    build_number INTEGER NOT NULL,
    source_url TEXT NOT NULL,
    download_path TEXT,
    extraction_path TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_history_target
    ON build_history (component_id, branch_id, deleted, created_at);

CREATE TABLE IF NOT EXISTS polling_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    component_id INTEGER,
    branch_id INTEGER,
    operation TEXT NOT NULL,
    duration_ms INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_created ON polling_logs (created_at);

CREATE TABLE IF NOT EXISTS polling_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Migration from version `n` to `n + 1` is `MIGRATIONS[n - 1]`.
pub const MIGRATIONS: &[fn(&Connection) -> rusqlite::Result<()>] = &[];

pub fn create(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}
