// ABOUTME: Audit log data model and schema
// ABOUTME: AuditRecord rows in the source database and the ChangeEvent stream unit

pub mod reader;

pub use reader::AuditReader;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::sqlite::RowData;

/// Name of the append-only audit table, colocated with the source data.
pub const AUDIT_TABLE: &str = "_cdc_audit_log";

/// Captured DML operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the audit table.
///
/// An audit row is committed iff the business write that produced it is
/// committed: the wrapper appends it inside the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonically increasing id; the ordering key and consumption cursor
    pub id: i64,
    pub table_name: String,
    pub operation: Operation,
    /// Primary-key value of the affected row, serialized as a string
    pub row_id: Option<String>,
    /// Pre-image; present for UPDATE and DELETE
    pub before_data: Option<RowData>,
    /// Post-image; present for INSERT and UPDATE
    pub after_data: Option<RowData>,
    pub created_at: DateTime<Utc>,
    /// Set once the change has been applied downstream
    pub consumed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl AuditRecord {
    /// Derive the in-memory stream unit from this record.
    pub fn to_change_event(&self) -> ChangeEvent {
        let row_id = self.row_id.clone().unwrap_or_default();
        ChangeEvent {
            event_id: format!("{}:{}:{}", self.id, self.table_name, row_id),
            audit_id: self.id,
            timestamp: self.created_at,
            operation: self.operation,
            table_name: self.table_name.clone(),
            row_id,
            before_data: self.before_data.clone(),
            after_data: self.after_data.clone(),
        }
    }
}

/// A single row-level change flowing through the sync engine.
///
/// `event_id` is globally unique within one source database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub audit_id: i64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub table_name: String,
    pub row_id: String,
    pub before_data: Option<RowData>,
    pub after_data: Option<RowData>,
}

/// Create the audit table and its indexes if absent.
///
/// The partial index keeps unconsumed-row polling cheap regardless of how
/// much consumed history the operator retains.
pub fn ensure_audit_table(conn: &Connection) -> Result<()> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('INSERT', 'UPDATE', 'DELETE')),
            row_id TEXT,
            before_data TEXT,
            after_data TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            consumed_at TIMESTAMP,
            retry_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_unconsumed
            ON {table} (id) WHERE consumed_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_{table}_table
            ON {table} (table_name, created_at);",
        table = AUDIT_TABLE
    );
    conn.execute_batch(&ddl)
        .context("Failed to create audit table")?;
    Ok(())
}

/// Current maximum audit id, or 0 when the table is empty or absent.
pub fn max_audit_id(conn: &Connection) -> Result<i64> {
    if !crate::sqlite::table_exists(conn, AUDIT_TABLE)? {
        return Ok(0);
    }
    let max: i64 = conn
        .query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {}", AUDIT_TABLE),
            [],
            |row| row.get(0),
        )
        .context("Failed to read max audit id")?;
    Ok(max)
}

/// Parse a timestamp column written either by SQLite's CURRENT_TIMESTAMP
/// or by this crate in RFC 3339.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trip() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("SELECT"), None);
    }

    #[test]
    fn event_id_format() {
        let record = AuditRecord {
            id: 12345,
            table_name: "users".into(),
            operation: Operation::Insert,
            row_id: Some("42".into()),
            before_data: None,
            after_data: Some(RowData::new()),
            created_at: Utc::now(),
            consumed_at: None,
            retry_count: 0,
        };
        let event = record.to_change_event();
        assert_eq!(event.event_id, "12345:users:42");
        assert_eq!(event.audit_id, 12345);
        assert_eq!(event.row_id, "42");
    }

    #[test]
    fn ensure_audit_table_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_audit_table(&conn).unwrap();
        ensure_audit_table(&conn).unwrap();
        assert!(crate::sqlite::table_exists(&conn, AUDIT_TABLE).unwrap());
        assert_eq!(max_audit_id(&conn).unwrap(), 0);
    }

    #[test]
    fn max_audit_id_without_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(max_audit_id(&conn).unwrap(), 0);
    }

    #[test]
    fn timestamp_parsing_accepts_both_formats() {
        let sqlite_style = parse_timestamp("2026-03-01 12:30:45");
        assert_eq!(sqlite_style.format("%Y-%m-%d").to_string(), "2026-03-01");

        let rfc = parse_timestamp("2026-03-01T12:30:45+00:00");
        assert_eq!(sqlite_style, rfc);
    }
}
