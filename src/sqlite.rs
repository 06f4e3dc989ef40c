// ABOUTME: Source SQLite helpers shared by capture and backfill
// ABOUTME: Connection opening, value conversion to JSON, and table introspection

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::capture::sql::{quote_ident, validate_identifier};

/// A row materialized as column name to JSON value.
pub type RowData = serde_json::Map<String, serde_json::Value>;

/// Open the source database and enforce WAL journal mode.
pub fn open_source(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open source database '{}'", path))?;

    let mode: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .context("Failed to set WAL journal mode")?;
    if !mode.eq_ignore_ascii_case("wal") {
        anyhow::bail!("source database '{}' refused WAL mode (got '{}')", path, mode);
    }

    Ok(conn)
}

/// Convert a single SQLite value to JSON.
pub fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        // BLOBs are not representable in JSON; carry them base64-less as a
        // lossy string the same way the text path does
        ValueRef::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Materialize the current row of a query as a JSON map.
///
/// `columns` must match the statement's column order.
pub fn row_to_map(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<RowData> {
    let mut map = RowData::new();
    for (idx, name) in columns.iter().enumerate() {
        map.insert(name.clone(), value_to_json(row.get_ref(idx)?));
    }
    Ok(map)
}

/// Column names of a table, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    validate_identifier(table).context("Invalid table name")?;

    let query = format!("SELECT * FROM {} LIMIT 0", quote_ident(table));
    let stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed to prepare column query for '{}'", table))?;
    Ok(stmt.column_names().iter().map(|s| s.to_string()).collect())
}

/// The declared single-column primary key of a table, if any.
///
/// Composite primary keys return `None`; backfill then falls back to the
/// implicit rowid, which requires the operator caveats documented on
/// `InitialSync`.
pub fn declared_primary_key(conn: &Connection, table: &str) -> Result<Option<String>> {
    validate_identifier(table).context("Invalid table name")?;

    let query = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed to read table_info for '{}'", table))?;

    // table_info: (cid, name, type, notnull, dflt_value, pk)
    let pk_columns: Vec<String> = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let pk: i64 = row.get(5)?;
            Ok((name, pk))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(name, _)| name)
        .collect();

    Ok(if pk_columns.len() == 1 {
        pk_columns.into_iter().next()
    } else {
        None
    })
}

/// Whether a table exists in the database.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .context("Failed to query sqlite_master")?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL);
             CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b));
             CREATE TABLE bare (x TEXT);
             INSERT INTO users VALUES (1, 'Alice', 9.5), (2, NULL, NULL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn converts_values_to_json() {
        let conn = test_conn();
        let columns = table_columns(&conn, "users").unwrap();
        assert_eq!(columns, vec!["id", "name", "score"]);

        let map = conn
            .query_row("SELECT * FROM users WHERE id = 1", [], |row| {
                row_to_map(row, &columns)
            })
            .unwrap();
        assert_eq!(map["id"], serde_json::json!(1));
        assert_eq!(map["name"], serde_json::json!("Alice"));
        assert_eq!(map["score"], serde_json::json!(9.5));

        let map = conn
            .query_row("SELECT * FROM users WHERE id = 2", [], |row| {
                row_to_map(row, &columns)
            })
            .unwrap();
        assert!(map["name"].is_null());
    }

    #[test]
    fn finds_declared_primary_key() {
        let conn = test_conn();
        assert_eq!(
            declared_primary_key(&conn, "users").unwrap(),
            Some("id".to_string())
        );
        // Composite keys are not usable as a seek column
        assert_eq!(declared_primary_key(&conn, "pairs").unwrap(), None);
        assert_eq!(declared_primary_key(&conn, "bare").unwrap(), None);
    }

    #[test]
    fn table_existence() {
        let conn = test_conn();
        assert!(table_exists(&conn, "users").unwrap());
        assert!(!table_exists(&conn, "missing").unwrap());
    }

    #[test]
    fn open_source_enforces_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.db");
        let conn = open_source(path.to_str().unwrap()).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
