//! SQLite-backed [`BuildStore`].
//!
//! Holds polling targets, tracking rows, build history, operational logs and persisted
//! settings in a single database file.

mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::contract::BuildStore;
use crate::model::{
    BuildHistoryEntry, BuildId, BuildTrackingRecord, DownloadStatus, ExtractionStatus,
    HistoryStatus, LogLevel, NewHistoryEntry, OperationType, PollingLogEntry, PollingTarget,
    TargetKey, TrackingUpdate,
};

pub use schema::SCHEMA_VERSION;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database {db_path:?}"))?;

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .context("Failed to read database version")?;

        if version == 0 {
            schema::create(&conn).context("Failed to create schema")?;
            info!(path = %db_path.display(), "Created new poller database");
        } else if version > SCHEMA_VERSION {
            bail!(
                "Database version {} is too new (max supported: {})",
                version,
                SCHEMA_VERSION
            );
        } else if version < SCHEMA_VERSION {
            Self::migrate(&conn, version)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh database that lives as long as the store. Used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection, from: i64) -> Result<()> {
        info!(from, to = SCHEMA_VERSION, "Migrating poller database");
        for version in from..SCHEMA_VERSION {
            let migration = usize::try_from(version - 1)
                .ok()
                .and_then(|idx| schema::MIGRATIONS.get(idx))
                .ok_or_else(|| anyhow!("No migration from version {version}"))?;
            migration(conn).with_context(|| format!("Migration from version {version} failed"))?;
        }
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store connection mutex poisoned"))
    }

    /// Insert or replace a polling target. Targets are owned by the admin UI; this
    /// exists for seeding and tests.
    pub fn upsert_target(&self, target: &PollingTarget) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO polling_targets (
                component_id, branch_id, component_guid, component_name, project_key,
                branch_name, polling_interval_secs, enabled, url_pattern
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (component_id, branch_id) DO UPDATE SET
                component_guid = excluded.component_guid,
                component_name = excluded.component_name,
                project_key = excluded.project_key,
                branch_name = excluded.branch_name,
                polling_interval_secs = excluded.polling_interval_secs,
                enabled = excluded.enabled,
                url_pattern = excluded.url_pattern"#,
            params![
                target.component_id,
                target.branch_id,
                target.component_guid,
                target.component_name,
                target.project_key,
                target.branch_name,
                target.polling_interval_secs as i64,
                target.enabled,
                target.url_pattern,
            ],
        )
        .context("Failed to upsert polling target")?;
        Ok(())
    }

    fn row_to_target(row: &rusqlite::Row) -> rusqlite::Result<PollingTarget> {
        Ok(PollingTarget {
            component_id: row.get("component_id")?,
            branch_id: row.get("branch_id")?,
            component_guid: row.get("component_guid")?,
            component_name: row.get("component_name")?,
            project_key: row.get("project_key")?,
            branch_name: row.get("branch_name")?,
            polling_interval_secs: row.get::<_, i64>("polling_interval_secs")?.max(0) as u64,
            enabled: row.get("enabled")?,
            url_pattern: row.get("url_pattern")?,
        })
    }

    fn row_to_tracking(row: &rusqlite::Row) -> rusqlite::Result<BuildTrackingRecord> {
        let download_status: String = row.get("download_status")?;
        let extraction_status: String = row.get("extraction_status")?;
        Ok(BuildTrackingRecord {
            component_id: row.get("component_id")?,
            branch_id: row.get("branch_id")?,
            build: read_build(row)?,
            download_status: DownloadStatus::from_db_str(&download_status)
                .ok_or_else(|| bad_value("download_status", &download_status))?,
            extraction_status: ExtractionStatus::from_db_str(&extraction_status)
                .ok_or_else(|| bad_value("extraction_status", &extraction_status))?,
            download_path: row.get::<_, Option<String>>("download_path")?.map(PathBuf::from),
            extraction_path: row
                .get::<_, Option<String>>("extraction_path")?
                .map(PathBuf::from),
            last_error: row.get("last_error")?,
            updated_at: millis_to_datetime(row.get("updated_at")?),
        })
    }

    fn row_to_history(row: &rusqlite::Row) -> rusqlite::Result<BuildHistoryEntry> {
        let status: String = row.get("status")?;
        Ok(BuildHistoryEntry {
            id: row.get("id")?,
            component_id: row.get("component_id")?,
            branch_id: row.get("branch_id")?,
            build: read_build(row)?,
            source_url: row.get("source_url")?,
            download_path: row.get::<_, Option<String>>("download_path")?.map(PathBuf::from),
            extraction_path: row
                .get::<_, Option<String>>("extraction_path")?
                .map(PathBuf::from),
            file_size: row.get::<_, i64>("file_size")?.max(0) as u64,
            checksum: row.get("checksum")?,
            status: HistoryStatus::from_db_str(&status)
                .ok_or_else(|| bad_value("status", &status))?,
            created_at: millis_to_datetime(row.get("created_at")?),
            deleted: row.get("deleted")?,
        })
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<PollingLogEntry> {
        let component_id: Option<i64> = row.get("component_id")?;
        let branch_id: Option<i64> = row.get("branch_id")?;
        Ok(PollingLogEntry {
            level: LogLevel::from_db_str(&row.get::<_, String>("level")?),
            message: row.get("message")?,
            target: component_id
                .zip(branch_id)
                .map(|(c, b)| TargetKey::new(c, b)),
            operation: OperationType::from_db_str(&row.get::<_, String>("operation")?),
            duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|d| d.max(0) as u64),
            created_at: millis_to_datetime(row.get("created_at")?),
        })
    }
}

impl BuildStore for SqliteStore {
    fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Store ping failed")?;
        Ok(())
    }

    fn list_targets(&self, enabled_only: bool) -> Result<Vec<PollingTarget>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM polling_targets
               WHERE enabled = 1 OR ?1 = 0
               ORDER BY component_id, branch_id"#,
        )?;
        let targets = stmt
            .query_map([enabled_only], Self::row_to_target)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list polling targets")?;
        Ok(targets)
    }

    fn get_target(&self, key: TargetKey) -> Result<Option<PollingTarget>> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                "SELECT * FROM polling_targets WHERE component_id = ?1 AND branch_id = ?2",
                params![key.component_id, key.branch_id],
                Self::row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    fn get_tracking(&self, key: TargetKey) -> Result<Option<BuildTrackingRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT * FROM build_tracking WHERE component_id = ?1 AND branch_id = ?2",
                params![key.component_id, key.branch_id],
                Self::row_to_tracking,
            )
            .optional()
            .with_context(|| format!("Failed to read tracking row for {key}"))?;
        Ok(record)
    }

    fn list_tracking(&self) -> Result<Vec<BuildTrackingRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM build_tracking ORDER BY component_id, branch_id")?;
        let records = stmt
            .query_map([], Self::row_to_tracking)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn upsert_tracking(&self, key: TargetKey, update: &TrackingUpdate) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO build_tracking (
                component_id, branch_id, build_date, build_number, download_status,
                extraction_status, download_path, extraction_path, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (component_id, branch_id) DO UPDATE SET
                build_date = excluded.build_date,
                build_number = excluded.build_number,
                download_status = excluded.download_status,
                extraction_status = excluded.extraction_status,
                download_path = excluded.download_path,
                extraction_path = excluded.extraction_path,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at"#,
            params![
                key.component_id,
                key.branch_id,
                update.build.date.to_string(),
                update.build.number,
                update.download_status.as_db_str(),
                update.extraction_status.as_db_str(),
                update.download_path.as_deref().map(path_to_db),
                update.extraction_path.as_deref().map(path_to_db),
                update.last_error,
                now_millis(),
            ],
        )
        .with_context(|| format!("Failed to upsert tracking row for {key}"))?;
        Ok(())
    }

    fn append_history(&self, key: TargetKey, entry: &NewHistoryEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO build_history (
                component_id, branch_id, build_date, build_number, source_url,
                download_path, extraction_path, file_size, checksum, status, created_at, deleted
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)"#,
            params![
                key.component_id,
                key.branch_id,
                entry.build.date.to_string(),
                entry.build.number,
                entry.source_url,
                entry.download_path.as_deref().map(path_to_db),
                entry.extraction_path.as_deref().map(path_to_db),
                entry.file_size as i64,
                entry.checksum,
                entry.status.as_db_str(),
                now_millis(),
            ],
        )
        .with_context(|| format!("Failed to append history row for {key}"))?;
        Ok(conn.last_insert_rowid())
    }

    fn list_active_history(&self, key: TargetKey) -> Result<Vec<BuildHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM build_history
               WHERE component_id = ?1 AND branch_id = ?2 AND deleted = 0
               ORDER BY created_at DESC, id DESC"#,
        )?;
        let rows = stmt
            .query_map(params![key.component_id, key.branch_id], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn list_history(&self, key: TargetKey) -> Result<Vec<BuildHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT * FROM build_history
               WHERE component_id = ?1 AND branch_id = ?2
               ORDER BY created_at DESC, id DESC"#,
        )?;
        let rows = stmt
            .query_map(params![key.component_id, key.branch_id], Self::row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn mark_history_deleted(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute("UPDATE build_history SET deleted = 1 WHERE id = ?1", [id])?;
        if changed == 0 {
            bail!("History row {id} does not exist");
        }
        Ok(())
    }

    fn append_log(&self, entry: &PollingLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO polling_logs (
                level, message, component_id, branch_id, operation, duration_ms, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                entry.level.as_db_str(),
                entry.message,
                entry.target.map(|t| t.component_id),
                entry.target.map(|t| t.branch_id),
                entry.operation.as_db_str(),
                entry.duration_ms.map(|d| d as i64),
                entry.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn recent_logs(&self, limit: usize) -> Result<Vec<PollingLogEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM polling_logs ORDER BY created_at DESC, id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map([limit as i64], Self::row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn load_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM polling_settings")?;
        let settings = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<String, String>>>()
            .context("Failed to load persisted settings")?;
        Ok(settings)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO polling_settings (key, value) VALUES (?1, ?2)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value"#,
            params![key, value],
        )?;
        Ok(())
    }
}

fn read_build(row: &rusqlite::Row) -> rusqlite::Result<BuildId> {
    let raw: String = row.get("build_date")?;
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(BuildId::new(date, row.get("build_number")?))
}

fn bad_value(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unexpected {column} value {value:?}").into(),
    )
}

fn path_to_db(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}
