// ABOUTME: CDC connection wrapper intercepting SQLite writes
// ABOUTME: Captures before/after images and appends audit rows atomically with the DML

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};

use crate::audit::{ensure_audit_table, Operation, AUDIT_TABLE};
use crate::capture::sql::{classify, extract_where_clause, quote_ident};
use crate::sqlite::RowData;

/// A matched row with the rowid it was found under.
struct CapturedRow {
    rowid: i64,
    data: RowData,
}

/// Wrapped SQLite connection that records every captured write in the
/// audit table, inside the same transaction as the write itself.
///
/// Writers that bypass the wrapper are invisible to replication; that is
/// the documented contract, not a defect.
pub struct CdcConnection {
    conn: Connection,
    /// Tables to capture; empty means all tables
    enabled_tables: HashSet<String>,
    /// Declared single-column PK per table, resolved lazily
    pk_cache: HashMap<String, Option<String>>,
    /// DML statements executed without capture because they could not be
    /// classified or their predicate could not be rebound
    skipped_statements: u64,
}

impl CdcConnection {
    /// Wrap an open connection. Ensures the audit table exists.
    pub fn new(conn: Connection, enabled_tables: &[String]) -> Result<Self> {
        ensure_audit_table(&conn)?;
        Ok(Self {
            conn,
            enabled_tables: enabled_tables.iter().cloned().collect(),
            pk_cache: HashMap::new(),
            skipped_statements: 0,
        })
    }

    /// Open the source database at `path` and wrap it.
    pub fn open(path: &str, enabled_tables: &[String]) -> Result<Self> {
        let conn = crate::sqlite::open_source(path)?;
        Self::new(conn, enabled_tables)
    }

    /// Read-only access to the underlying connection.
    ///
    /// Reads need no capture; use this for SELECTs.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Unwrap, returning the inner connection.
    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Count of DML statements that ran without capture.
    pub fn skipped_statements(&self) -> u64 {
        self.skipped_statements
    }

    fn should_capture(&self, table: &str) -> bool {
        table != AUDIT_TABLE
            && (self.enabled_tables.is_empty() || self.enabled_tables.contains(table))
    }

    /// Execute a statement, capturing audit rows for INSERT/UPDATE/DELETE
    /// against enabled tables. Returns the number of affected rows.
    ///
    /// The business mutation and its audit rows commit together; any
    /// failure inside the captured path rolls both back and surfaces the
    /// error to the caller.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        match self.capture_plan(sql, params) {
            Some((operation, table)) => {
                let tx = self
                    .conn
                    .transaction()
                    .context("Failed to begin capture transaction")?;
                let affected =
                    execute_captured(&tx, sql, params, operation, &table, &mut self.pk_cache)?;
                tx.commit().context("Failed to commit capture transaction")?;
                Ok(affected)
            }
            None => {
                let affected = self
                    .conn
                    .execute(sql, params_from_iter(params.iter()))
                    .with_context(|| format!("Failed to execute statement: {}", sql))?;
                Ok(affected)
            }
        }
    }

    /// Execute the same statement once per parameter tuple, inside one
    /// transaction, producing one audit row per affected row with order
    /// preserved.
    pub fn execute_batch_params(&mut self, sql: &str, params_list: &[Vec<Value>]) -> Result<usize> {
        let plan = match params_list.first() {
            Some(first) => self.capture_plan(sql, first),
            None => return Ok(0),
        };

        let tx = self
            .conn
            .transaction()
            .context("Failed to begin batch transaction")?;
        let mut affected = 0;
        for params in params_list {
            affected += match &plan {
                Some((operation, table)) => {
                    execute_captured(&tx, sql, params, *operation, table, &mut self.pk_cache)?
                }
                None => tx
                    .execute(sql, params_from_iter(params.iter()))
                    .with_context(|| format!("Failed to execute statement: {}", sql))?,
            };
        }
        tx.commit().context("Failed to commit batch transaction")?;
        Ok(affected)
    }

    /// Decide whether this statement goes down the captured path.
    ///
    /// `None` means plain execution: non-DML, tables outside the
    /// allow-list, or predicates whose placeholders cannot be rebound for
    /// the before-image read.
    fn capture_plan(&mut self, sql: &str, params: &[Value]) -> Option<(Operation, String)> {
        let (operation, table) = match classify(sql) {
            Some(parsed) => parsed,
            None => {
                if crate::capture::sql::parse_operation(sql).is_some() {
                    self.skipped_statements += 1;
                    tracing::warn!("Unclassifiable DML executed without capture: {}", sql);
                }
                return None;
            }
        };

        if !self.should_capture(&table) {
            return None;
        }

        if matches!(operation, Operation::Update | Operation::Delete) {
            let placeholders = extract_where_clause(sql)
                .map(|clause| clause.matches('?').count())
                .unwrap_or(0);
            if placeholders > params.len() {
                self.skipped_statements += 1;
                tracing::warn!(
                    "Predicate of '{}' cannot be rebound for capture; executing uncaptured",
                    sql
                );
                return None;
            }
        }

        Some((operation, table))
    }
}

/// Run one captured statement on an open transaction.
fn execute_captured(
    tx: &Transaction<'_>,
    sql: &str,
    params: &[Value],
    operation: Operation,
    table: &str,
    pk_cache: &mut HashMap<String, Option<String>>,
) -> Result<usize> {
    let columns = crate::sqlite::table_columns(tx, table)?;
    let pk_column = effective_pk(tx, table, pk_cache)?;

    let before_rows = match operation {
        Operation::Update | Operation::Delete => {
            fetch_matched_rows(tx, table, &columns, sql, params)?
        }
        Operation::Insert => Vec::new(),
    };

    // Snapshot before the write so multi-row inserts can be found by the
    // rowids they were assigned
    let pre_max_rowid = match operation {
        Operation::Insert => max_rowid(tx, table)?,
        _ => 0,
    };

    let affected = tx
        .execute(sql, params_from_iter(params.iter()))
        .with_context(|| format!("Failed to execute statement: {}", sql))?;

    match operation {
        Operation::Insert => {
            let mut inserted = fetch_rows_above(tx, table, &columns, pre_max_rowid)?;
            if inserted.len() != affected && affected == 1 {
                // Explicit rowid below the previous maximum
                inserted = fetch_row_by_rowid(tx, table, &columns, tx.last_insert_rowid())?
                    .into_iter()
                    .collect();
            }
            for row in inserted {
                let row_id = row_identifier(&row, pk_column.as_deref());
                append_audit_row(tx, table, operation, &row_id, None, Some(&row.data))?;
            }
        }
        Operation::Update => {
            for before in &before_rows {
                let after = fetch_row_by_rowid(tx, table, &columns, before.rowid)?;
                let row_id = row_identifier(before, pk_column.as_deref());
                append_audit_row(
                    tx,
                    table,
                    operation,
                    &row_id,
                    Some(&before.data),
                    after.as_ref().map(|r| &r.data),
                )?;
            }
        }
        Operation::Delete => {
            for before in &before_rows {
                let row_id = row_identifier(before, pk_column.as_deref());
                append_audit_row(tx, table, operation, &row_id, Some(&before.data), None)?;
            }
        }
    }

    Ok(affected)
}

fn effective_pk(
    conn: &Connection,
    table: &str,
    cache: &mut HashMap<String, Option<String>>,
) -> Result<Option<String>> {
    if let Some(pk) = cache.get(table) {
        return Ok(pk.clone());
    }
    let pk = crate::sqlite::declared_primary_key(conn, table)?;
    cache.insert(table.to_string(), pk.clone());
    Ok(pk)
}

/// The primary-key value of a captured row, as a string.
fn row_identifier(row: &CapturedRow, pk_column: Option<&str>) -> String {
    match pk_column.and_then(|pk| row.data.get(pk)) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => row.rowid.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Select the rows an UPDATE/DELETE predicate matches, before the write.
///
/// Placeholders in the predicate are rebound from the tail of the
/// statement's parameters (SET values precede WHERE values).
fn fetch_matched_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
    sql: &str,
    params: &[Value],
) -> Result<Vec<CapturedRow>> {
    let (select, bound) = match extract_where_clause(sql) {
        Some(clause) => {
            let n = clause.matches('?').count();
            let select = format!(
                "SELECT rowid, * FROM {} WHERE {}",
                quote_ident(table),
                clause
            );
            (select, &params[params.len() - n..])
        }
        // No predicate: the statement affects every row
        None => (
            format!("SELECT rowid, * FROM {}", quote_ident(table)),
            &params[params.len()..],
        ),
    };

    collect_rows(conn, &select, bound, columns)
        .with_context(|| format!("Failed to capture before-image for '{}'", table))
}

fn fetch_rows_above(
    conn: &Connection,
    table: &str,
    columns: &[String],
    rowid_floor: i64,
) -> Result<Vec<CapturedRow>> {
    let select = format!(
        "SELECT rowid, * FROM {} WHERE rowid > ? ORDER BY rowid",
        quote_ident(table)
    );
    collect_rows(conn, &select, &[Value::Integer(rowid_floor)], columns)
        .with_context(|| format!("Failed to capture after-image for '{}'", table))
}

fn fetch_row_by_rowid(
    conn: &Connection,
    table: &str,
    columns: &[String],
    rowid: i64,
) -> Result<Option<CapturedRow>> {
    let select = format!("SELECT rowid, * FROM {} WHERE rowid = ?", quote_ident(table));
    let mut rows = collect_rows(conn, &select, &[Value::Integer(rowid)], columns)
        .with_context(|| format!("Failed to re-read row {} of '{}'", rowid, table))?;
    Ok(rows.pop())
}

fn collect_rows(
    conn: &Connection,
    select: &str,
    params: &[Value],
    columns: &[String],
) -> Result<Vec<CapturedRow>> {
    let mut stmt = conn.prepare(select)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            let rowid: i64 = row.get(0)?;
            let mut data = RowData::new();
            // Column 0 is the rowid; business columns start at 1
            for (idx, name) in columns.iter().enumerate() {
                data.insert(name.clone(), crate::sqlite::value_to_json(row.get_ref(idx + 1)?));
            }
            Ok(CapturedRow { rowid, data })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn append_audit_row(
    tx: &Transaction<'_>,
    table: &str,
    operation: Operation,
    row_id: &str,
    before: Option<&RowData>,
    after: Option<&RowData>,
) -> Result<()> {
    let before_json = before
        .map(|data| serde_json::to_string(data))
        .transpose()
        .context("Failed to serialize before-image")?;
    let after_json = after
        .map(|data| serde_json::to_string(data))
        .transpose()
        .context("Failed to serialize after-image")?;

    tx.execute(
        &format!(
            "INSERT INTO {} (table_name, operation, row_id, before_data, after_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            AUDIT_TABLE
        ),
        rusqlite::params![table, operation.as_str(), row_id, before_json, after_json],
    )
    .map_err(|e| {
        // The caller rolls the whole transaction back: audit and business
        // rows commit together or not at all
        anyhow::Error::from(crate::error::SyncError::Capture {
            table: table.to_string(),
            message: e.to_string(),
        })
    })?;
    Ok(())
}

fn max_rowid(conn: &Connection, table: &str) -> Result<i64> {
    let max: i64 = conn.query_row(
        &format!("SELECT COALESCE(MAX(rowid), 0) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped() -> CdcConnection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT
            );
            CREATE TABLE notes (body TEXT);",
        )
        .unwrap();
        CdcConnection::new(conn, &[]).unwrap()
    }

    fn audit_rows(conn: &Connection) -> Vec<(String, String, String, Option<String>, Option<String>)> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT table_name, operation, row_id, before_data, after_data
                 FROM {} ORDER BY id",
                AUDIT_TABLE
            ))
            .unwrap();
        stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
    }

    #[test]
    fn insert_capture() {
        let mut cdc = wrapped();
        let affected = cdc
            .execute(
                "INSERT INTO users (name, email) VALUES (?, ?)",
                &[Value::from("Zhang".to_string()), Value::from("z@x.com".to_string())],
            )
            .unwrap();
        assert_eq!(affected, 1);

        let rows = audit_rows(cdc.connection());
        assert_eq!(rows.len(), 1);
        let (table, op, row_id, before, after) = &rows[0];
        assert_eq!(table, "users");
        assert_eq!(op, "INSERT");
        assert_eq!(row_id, "1");
        assert!(before.is_none());

        let after: serde_json::Value = serde_json::from_str(after.as_ref().unwrap()).unwrap();
        assert_eq!(after["id"], 1);
        assert_eq!(after["name"], "Zhang");
        assert_eq!(after["email"], "z@x.com");
    }

    #[test]
    fn update_capture_has_both_images() {
        let mut cdc = wrapped();
        cdc.execute(
            "INSERT INTO users (name, email) VALUES (?, ?)",
            &[Value::from("Zhang".to_string()), Value::from("z@x.com".to_string())],
        )
        .unwrap();

        cdc.execute(
            "UPDATE users SET name = ? WHERE id = ?",
            &[Value::from("Li".to_string()), Value::Integer(1)],
        )
        .unwrap();

        let rows = audit_rows(cdc.connection());
        assert_eq!(rows.len(), 2);
        let (_, op, row_id, before, after) = &rows[1];
        assert_eq!(op, "UPDATE");
        assert_eq!(row_id, "1");

        let before: serde_json::Value = serde_json::from_str(before.as_ref().unwrap()).unwrap();
        let after: serde_json::Value = serde_json::from_str(after.as_ref().unwrap()).unwrap();
        assert_eq!(before["name"], "Zhang");
        assert_eq!(after["name"], "Li");
        assert_eq!(after["email"], "z@x.com");
    }

    #[test]
    fn delete_capture_has_before_image() {
        let mut cdc = wrapped();
        cdc.execute(
            "INSERT INTO users (name) VALUES (?)",
            &[Value::from("Zhang".to_string())],
        )
        .unwrap();
        cdc.execute("DELETE FROM users WHERE id = ?", &[Value::Integer(1)])
            .unwrap();

        let rows = audit_rows(cdc.connection());
        let (_, op, row_id, before, after) = &rows[1];
        assert_eq!(op, "DELETE");
        assert_eq!(row_id, "1");
        assert!(before.is_some());
        assert!(after.is_none());
    }

    #[test]
    fn multi_row_update_captures_each_row() {
        let mut cdc = wrapped();
        cdc.execute_batch_params(
            "INSERT INTO users (name) VALUES (?)",
            &[
                vec![Value::from("a".to_string())],
                vec![Value::from("b".to_string())],
                vec![Value::from("c".to_string())],
            ],
        )
        .unwrap();

        let affected = cdc
            .execute("UPDATE users SET email = ? WHERE id > ?", &[
                Value::from("x@x.com".to_string()),
                Value::Integer(1),
            ])
            .unwrap();
        assert_eq!(affected, 2);

        let rows = audit_rows(cdc.connection());
        let updates: Vec<_> = rows.iter().filter(|r| r.1 == "UPDATE").collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].2, "2");
        assert_eq!(updates[1].2, "3");
    }

    #[test]
    fn batch_insert_preserves_order() {
        let mut cdc = wrapped();
        let affected = cdc
            .execute_batch_params(
                "INSERT INTO users (name) VALUES (?)",
                &[
                    vec![Value::from("first".to_string())],
                    vec![Value::from("second".to_string())],
                ],
            )
            .unwrap();
        assert_eq!(affected, 2);

        let rows = audit_rows(cdc.connection());
        assert_eq!(rows.len(), 2);
        let first: serde_json::Value =
            serde_json::from_str(rows[0].4.as_ref().unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(rows[1].4.as_ref().unwrap()).unwrap();
        assert_eq!(first["name"], "first");
        assert_eq!(second["name"], "second");
    }

    #[test]
    fn failed_write_leaves_no_audit_row() {
        let mut cdc = wrapped();
        // name is NOT NULL; this insert must fail
        let result = cdc.execute("INSERT INTO users (email) VALUES (?)", &[
            Value::from("x@x.com".to_string()),
        ]);
        assert!(result.is_err());

        assert!(audit_rows(cdc.connection()).is_empty());
        let count: i64 = cdc
            .connection()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn allow_list_excludes_other_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE ignored (id INTEGER PRIMARY KEY, x TEXT);",
        )
        .unwrap();
        let mut cdc = CdcConnection::new(conn, &["users".to_string()]).unwrap();

        cdc.execute("INSERT INTO users (name) VALUES (?)", &[
            Value::from("a".to_string()),
        ])
        .unwrap();
        cdc.execute("INSERT INTO ignored (x) VALUES (?)", &[
            Value::from("b".to_string()),
        ])
        .unwrap();

        let rows = audit_rows(cdc.connection());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "users");
    }

    #[test]
    fn non_dml_passes_through() {
        let mut cdc = wrapped();
        cdc.execute("CREATE INDEX idx_users_name ON users (name)", &[])
            .unwrap();
        assert!(audit_rows(cdc.connection()).is_empty());
        assert_eq!(cdc.skipped_statements(), 0);
    }

    #[test]
    fn rows_without_declared_pk_use_rowid() {
        let mut cdc = wrapped();
        cdc.execute("INSERT INTO notes (body) VALUES (?)", &[
            Value::from("hello".to_string()),
        ])
        .unwrap();

        let rows = audit_rows(cdc.connection());
        assert_eq!(rows[0].2, "1");
    }

    #[test]
    fn predicate_less_delete_captures_all_rows() {
        let mut cdc = wrapped();
        cdc.execute_batch_params(
            "INSERT INTO users (name) VALUES (?)",
            &[
                vec![Value::from("a".to_string())],
                vec![Value::from("b".to_string())],
            ],
        )
        .unwrap();

        cdc.execute("DELETE FROM users", &[]).unwrap();

        let deletes: Vec<_> = audit_rows(cdc.connection())
            .into_iter()
            .filter(|r| r.1 == "DELETE")
            .collect();
        assert_eq!(deletes.len(), 2);
    }
}
