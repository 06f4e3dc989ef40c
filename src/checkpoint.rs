// ABOUTME: Durable sync progress metadata in a local SQLite file
// ABOUTME: Incremental positions, initial-sync checkpoints, error log, and per-table stats

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::audit::parse_timestamp;

/// Incremental sync position for one `(source, target)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPosition {
    pub source_db_path: String,
    pub target_name: String,
    /// Highest audit id durably applied to this target
    pub last_audit_id: i64,
    pub total_events: u64,
    pub last_processed_at: DateTime<Utc>,
}

impl SyncPosition {
    pub fn zero(source_db_path: &str, target_name: &str) -> Self {
        Self {
            source_db_path: source_db_path.to_string(),
            target_name: target_name.to_string(),
            last_audit_id: 0,
            total_events: 0,
            last_processed_at: Utc::now(),
        }
    }
}

/// Initial-sync progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => CheckpointStatus::Completed,
            "failed" => CheckpointStatus::Failed,
            _ => CheckpointStatus::Running,
        }
    }
}

/// Primary-key value used as the seek cursor during backfill.
///
/// SQLite keys are either integers or text; the checkpoint stores both as
/// text and restores the integer form when it parses back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkValue {
    Int(i64),
    Text(String),
}

impl PkValue {
    pub fn parse(raw: &str) -> Self {
        raw.parse::<i64>()
            .map(PkValue::Int)
            .unwrap_or_else(|_| PkValue::Text(raw.to_string()))
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(PkValue::Int),
            serde_json::Value::String(s) => Some(PkValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_sql_value(&self) -> rusqlite::types::Value {
        match self {
            PkValue::Int(i) => rusqlite::types::Value::Integer(*i),
            PkValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
        }
    }
}

impl std::fmt::Display for PkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkValue::Int(i) => write!(f, "{}", i),
            PkValue::Text(s) => f.write_str(s),
        }
    }
}

/// Per-table backfill checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncCheckpoint {
    pub table_name: String,
    pub last_pk: Option<PkValue>,
    pub total_synced: u64,
    pub status: CheckpointStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InitialSyncCheckpoint {
    pub fn new(table_name: &str) -> Self {
        let now = Utc::now();
        Self {
            table_name: table_name.to_string(),
            last_pk: None,
            total_synced: 0,
            status: CheckpointStatus::Running,
            started_at: now,
            updated_at: now,
        }
    }
}

/// One entry of the per-target error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub target_name: String,
    pub event_id: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Durable checkpoint store backed by a dedicated SQLite metadata file,
/// distinct from the source database. Single writer per run; every write
/// is an atomic upsert.
pub struct CheckpointStore {
    conn: Connection,
}

impl CheckpointStore {
    /// Open (and initialize) the metadata database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create checkpoint directory {:?}", parent)
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open checkpoint database {:?}", path))?;
        let store = Self { conn };
        store.ensure_tables()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory().context("Failed to open in-memory store")?,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_positions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_db_path TEXT NOT NULL,
                    target_name TEXT NOT NULL,
                    last_audit_id INTEGER NOT NULL DEFAULT 0,
                    total_events INTEGER NOT NULL DEFAULT 0,
                    last_processed_at TIMESTAMP,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE (source_db_path, target_name)
                );

                CREATE TABLE IF NOT EXISTS initial_sync_checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_db_path TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    last_pk TEXT,
                    total_synced INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'running',
                    started_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    UNIQUE (source_db_path, table_name)
                );

                CREATE TABLE IF NOT EXISTS sync_errors (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_db_path TEXT NOT NULL,
                    target_name TEXT NOT NULL,
                    event_id TEXT,
                    error_kind TEXT NOT NULL,
                    error_message TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    resolved INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    resolved_at TIMESTAMP
                );

                CREATE TABLE IF NOT EXISTS sync_stats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_db_path TEXT NOT NULL,
                    target_name TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    last_sync_at TIMESTAMP,
                    UNIQUE (source_db_path, target_name, table_name, operation)
                );

                CREATE TABLE IF NOT EXISTS sync_meta (
                    source_db_path TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (source_db_path, key)
                );

                CREATE INDEX IF NOT EXISTS idx_errors_unresolved
                    ON sync_errors (resolved, created_at) WHERE resolved = 0;",
            )
            .context("Failed to create checkpoint tables")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Incremental positions
    // ------------------------------------------------------------------

    /// Atomic upsert of an incremental position.
    ///
    /// `last_audit_id` is monotone: an attempt to move it backwards keeps
    /// the stored value.
    pub fn save_position(&self, position: &SyncPosition) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_positions
                    (source_db_path, target_name, last_audit_id, total_events,
                     last_processed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (source_db_path, target_name) DO UPDATE SET
                    last_audit_id = MAX(sync_positions.last_audit_id, excluded.last_audit_id),
                    total_events = excluded.total_events,
                    last_processed_at = excluded.last_processed_at,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    position.source_db_path,
                    position.target_name,
                    position.last_audit_id,
                    position.total_events as i64,
                    position.last_processed_at.to_rfc3339(),
                ],
            )
            .context("Failed to save sync position")?;
        Ok(())
    }

    /// Load a position, or the zero position when none is stored.
    pub fn load_position(&self, source_db_path: &str, target_name: &str) -> Result<SyncPosition> {
        let row = self
            .conn
            .query_row(
                "SELECT last_audit_id, total_events, last_processed_at
                 FROM sync_positions
                 WHERE source_db_path = ?1 AND target_name = ?2",
                rusqlite::params![source_db_path, target_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to load sync position")?;

        Ok(match row {
            Some((last_audit_id, total_events, processed_at)) => SyncPosition {
                source_db_path: source_db_path.to_string(),
                target_name: target_name.to_string(),
                last_audit_id,
                total_events: total_events as u64,
                last_processed_at: processed_at
                    .as_deref()
                    .map(parse_timestamp)
                    .unwrap_or_else(Utc::now),
            },
            None => SyncPosition::zero(source_db_path, target_name),
        })
    }

    // ------------------------------------------------------------------
    // Initial-sync checkpoints
    // ------------------------------------------------------------------

    pub fn save_initial_checkpoint(
        &self,
        source_db_path: &str,
        checkpoint: &InitialSyncCheckpoint,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO initial_sync_checkpoints
                    (source_db_path, table_name, last_pk, total_synced, status,
                     started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (source_db_path, table_name) DO UPDATE SET
                    last_pk = excluded.last_pk,
                    total_synced = excluded.total_synced,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    source_db_path,
                    checkpoint.table_name,
                    checkpoint.last_pk.as_ref().map(|pk| pk.to_string()),
                    checkpoint.total_synced as i64,
                    checkpoint.status.as_str(),
                    checkpoint.started_at.to_rfc3339(),
                    checkpoint.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to save initial-sync checkpoint")?;
        Ok(())
    }

    pub fn load_initial_checkpoint(
        &self,
        source_db_path: &str,
        table_name: &str,
    ) -> Result<Option<InitialSyncCheckpoint>> {
        let row = self
            .conn
            .query_row(
                "SELECT table_name, last_pk, total_synced, status, started_at, updated_at
                 FROM initial_sync_checkpoints
                 WHERE source_db_path = ?1 AND table_name = ?2",
                rusqlite::params![source_db_path, table_name],
                decode_initial_checkpoint,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to load initial-sync checkpoint")?;
        Ok(row)
    }

    pub fn list_initial_checkpoints(
        &self,
        source_db_path: &str,
    ) -> Result<Vec<InitialSyncCheckpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT table_name, last_pk, total_synced, status, started_at, updated_at
                 FROM initial_sync_checkpoints
                 WHERE source_db_path = ?1
                 ORDER BY table_name",
            )
            .context("Failed to prepare checkpoint listing")?;
        let rows = stmt
            .query_map([source_db_path], decode_initial_checkpoint)
            .context("Failed to list initial-sync checkpoints")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode initial-sync checkpoints")?;
        Ok(rows)
    }

    /// Delete a table's backfill checkpoint so the next run starts over.
    pub fn delete_initial_checkpoint(&self, source_db_path: &str, table_name: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM initial_sync_checkpoints
                 WHERE source_db_path = ?1 AND table_name = ?2",
                rusqlite::params![source_db_path, table_name],
            )
            .context("Failed to delete initial-sync checkpoint")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handoff boundary
    // ------------------------------------------------------------------

    /// Persist the audit id pinned at the start of initial sync.
    pub fn save_handoff_id(&self, source_db_path: &str, handoff_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_meta (source_db_path, key, value, updated_at)
                 VALUES (?1, 'handoff_id', ?2, ?3)
                 ON CONFLICT (source_db_path, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                rusqlite::params![source_db_path, handoff_id.to_string(), Utc::now().to_rfc3339()],
            )
            .context("Failed to save handoff id")?;
        Ok(())
    }

    pub fn load_handoff_id(&self, source_db_path: &str) -> Result<Option<i64>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE source_db_path = ?1 AND key = 'handoff_id'",
                [source_db_path],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to load handoff id")?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    // ------------------------------------------------------------------
    // Error log
    // ------------------------------------------------------------------

    pub fn log_error(
        &self,
        source_db_path: &str,
        target_name: &str,
        event_id: Option<&str>,
        error_kind: &str,
        error_message: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO sync_errors
                    (source_db_path, target_name, event_id, error_kind, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![source_db_path, target_name, event_id, error_kind, error_message],
            )
            .context("Failed to log sync error")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_unresolved_errors(
        &self,
        source_db_path: &str,
        target_name: Option<&str>,
    ) -> Result<Vec<SyncErrorRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_name, event_id, error_kind, error_message,
                        retry_count, created_at
                 FROM sync_errors
                 WHERE source_db_path = ?1
                   AND resolved = 0
                   AND (?2 IS NULL OR target_name = ?2)
                 ORDER BY created_at",
            )
            .context("Failed to prepare error listing")?;

        let rows = stmt
            .query_map(rusqlite::params![source_db_path, target_name], |row| {
                let created: String = row.get(6)?;
                Ok(SyncErrorRecord {
                    id: row.get(0)?,
                    target_name: row.get(1)?,
                    event_id: row.get(2)?,
                    error_kind: row.get(3)?,
                    error_message: row.get(4)?,
                    retry_count: row.get::<_, i64>(5)? as u32,
                    created_at: parse_timestamp(&created),
                })
            })
            .context("Failed to list unresolved errors")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode unresolved errors")?;
        Ok(rows)
    }

    pub fn resolve_error(&self, error_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sync_errors SET resolved = 1, resolved_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), error_id],
            )
            .context("Failed to resolve error")?;
        Ok(())
    }

    pub fn increment_retry_count(&self, error_id: i64) -> Result<u32> {
        self.conn
            .execute(
                "UPDATE sync_errors SET retry_count = retry_count + 1 WHERE id = ?1",
                [error_id],
            )
            .context("Failed to increment retry count")?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT retry_count FROM sync_errors WHERE id = ?1",
                [error_id],
                |row| row.get(0),
            )
            .context("Failed to read retry count")?;
        Ok(count as u32)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn update_stats(
        &self,
        source_db_path: &str,
        target_name: &str,
        table_name: &str,
        operation: &str,
        count: u64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_stats
                    (source_db_path, target_name, table_name, operation, count, last_sync_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (source_db_path, target_name, table_name, operation)
                 DO UPDATE SET
                    count = sync_stats.count + excluded.count,
                    last_sync_at = excluded.last_sync_at",
                rusqlite::params![
                    source_db_path,
                    target_name,
                    table_name,
                    operation,
                    count as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update sync stats")?;
        Ok(())
    }

    /// Per-`table.operation` counters for one target.
    pub fn get_stats(
        &self,
        source_db_path: &str,
        target_name: &str,
    ) -> Result<Vec<(String, String, u64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT table_name, operation, count
                 FROM sync_stats
                 WHERE source_db_path = ?1 AND target_name = ?2
                 ORDER BY table_name, operation",
            )
            .context("Failed to prepare stats query")?;
        let rows = stmt
            .query_map(rusqlite::params![source_db_path, target_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })
            .context("Failed to query stats")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode stats")?;
        Ok(rows)
    }

    pub fn reset_stats(&self, source_db_path: &str, target_name: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_stats WHERE source_db_path = ?1 AND target_name = ?2",
                rusqlite::params![source_db_path, target_name],
            )
            .context("Failed to reset stats")?;
        Ok(())
    }
}

fn decode_initial_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<InitialSyncCheckpoint> {
    let last_pk: Option<String> = row.get(1)?;
    let status: String = row.get(3)?;
    let started: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(InitialSyncCheckpoint {
        table_name: row.get(0)?,
        last_pk: last_pk.as_deref().map(PkValue::parse),
        total_synced: row.get::<_, i64>(2)? as u64,
        status: CheckpointStatus::parse(&status),
        started_at: parse_timestamp(&started),
        updated_at: parse_timestamp(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_position_when_absent() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let position = store.load_position("/data/app.db", "mysql_prod").unwrap();
        assert_eq!(position.last_audit_id, 0);
        assert_eq!(position.total_events, 0);
    }

    #[test]
    fn position_round_trip() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let mut position = SyncPosition::zero("/data/app.db", "mysql_prod");
        position.last_audit_id = 42;
        position.total_events = 100;
        store.save_position(&position).unwrap();

        let loaded = store.load_position("/data/app.db", "mysql_prod").unwrap();
        assert_eq!(loaded.last_audit_id, 42);
        assert_eq!(loaded.total_events, 100);
    }

    #[test]
    fn position_never_regresses() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let mut position = SyncPosition::zero("/data/app.db", "t");
        position.last_audit_id = 50;
        store.save_position(&position).unwrap();

        position.last_audit_id = 10;
        store.save_position(&position).unwrap();

        let loaded = store.load_position("/data/app.db", "t").unwrap();
        assert_eq!(loaded.last_audit_id, 50);
    }

    #[test]
    fn positions_are_per_target() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let mut a = SyncPosition::zero("/data/app.db", "a");
        a.last_audit_id = 5;
        let mut b = SyncPosition::zero("/data/app.db", "b");
        b.last_audit_id = 9;
        store.save_position(&a).unwrap();
        store.save_position(&b).unwrap();

        assert_eq!(store.load_position("/data/app.db", "a").unwrap().last_audit_id, 5);
        assert_eq!(store.load_position("/data/app.db", "b").unwrap().last_audit_id, 9);
    }

    #[test]
    fn initial_checkpoint_round_trip() {
        let store = CheckpointStore::open_in_memory().unwrap();
        assert!(store
            .load_initial_checkpoint("/data/app.db", "users")
            .unwrap()
            .is_none());

        let mut checkpoint = InitialSyncCheckpoint::new("users");
        checkpoint.last_pk = Some(PkValue::Int(1000));
        checkpoint.total_synced = 1000;
        store
            .save_initial_checkpoint("/data/app.db", &checkpoint)
            .unwrap();

        let loaded = store
            .load_initial_checkpoint("/data/app.db", "users")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_pk, Some(PkValue::Int(1000)));
        assert_eq!(loaded.total_synced, 1000);
        assert_eq!(loaded.status, CheckpointStatus::Running);

        checkpoint.status = CheckpointStatus::Completed;
        store
            .save_initial_checkpoint("/data/app.db", &checkpoint)
            .unwrap();
        let loaded = store
            .load_initial_checkpoint("/data/app.db", "users")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, CheckpointStatus::Completed);
    }

    #[test]
    fn text_pk_round_trip() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let mut checkpoint = InitialSyncCheckpoint::new("orders");
        checkpoint.last_pk = Some(PkValue::Text("ORD-000123".into()));
        store
            .save_initial_checkpoint("/data/app.db", &checkpoint)
            .unwrap();

        let loaded = store
            .load_initial_checkpoint("/data/app.db", "orders")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_pk, Some(PkValue::Text("ORD-000123".into())));
    }

    #[test]
    fn delete_checkpoint_resets_table() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store
            .save_initial_checkpoint("/data/app.db", &InitialSyncCheckpoint::new("users"))
            .unwrap();
        store
            .delete_initial_checkpoint("/data/app.db", "users")
            .unwrap();
        assert!(store
            .load_initial_checkpoint("/data/app.db", "users")
            .unwrap()
            .is_none());
    }

    #[test]
    fn handoff_id_round_trip() {
        let store = CheckpointStore::open_in_memory().unwrap();
        assert_eq!(store.load_handoff_id("/data/app.db").unwrap(), None);
        store.save_handoff_id("/data/app.db", 777).unwrap();
        assert_eq!(store.load_handoff_id("/data/app.db").unwrap(), Some(777));
    }

    #[test]
    fn error_log_lifecycle() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let id = store
            .log_error(
                "/data/app.db",
                "mysql_prod",
                Some("7:users:1"),
                "data",
                "cannot cast 'x' to int",
            )
            .unwrap();

        let errors = store.list_unresolved_errors("/data/app.db", None).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event_id.as_deref(), Some("7:users:1"));
        assert_eq!(errors[0].error_kind, "data");

        assert_eq!(store.increment_retry_count(id).unwrap(), 1);
        assert_eq!(store.increment_retry_count(id).unwrap(), 2);

        store.resolve_error(id).unwrap();
        assert!(store
            .list_unresolved_errors("/data/app.db", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn error_listing_filters_by_target() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store
            .log_error("/data/app.db", "a", None, "transient", "boom")
            .unwrap();
        store
            .log_error("/data/app.db", "b", None, "transient", "boom")
            .unwrap();

        let all = store.list_unresolved_errors("/data/app.db", None).unwrap();
        assert_eq!(all.len(), 2);
        let only_a = store
            .list_unresolved_errors("/data/app.db", Some("a"))
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].target_name, "a");
    }

    #[test]
    fn stats_accumulate() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store
            .update_stats("/data/app.db", "t", "users", "INSERT", 3)
            .unwrap();
        store
            .update_stats("/data/app.db", "t", "users", "INSERT", 2)
            .unwrap();
        store
            .update_stats("/data/app.db", "t", "users", "DELETE", 1)
            .unwrap();

        let stats = store.get_stats("/data/app.db", "t").unwrap();
        assert_eq!(
            stats,
            vec![
                ("users".to_string(), "DELETE".to_string(), 1),
                ("users".to_string(), "INSERT".to_string(), 5),
            ]
        );

        store.reset_stats("/data/app.db", "t").unwrap();
        assert!(store.get_stats("/data/app.db", "t").unwrap().is_empty());
    }
}
