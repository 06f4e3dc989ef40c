// ABOUTME: MySQL target writer
// ABOUTME: Batched INSERT ... ON DUPLICATE KEY UPDATE with per-row fallback

use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts};

use crate::checkpoint::PkValue;
use crate::config::MySqlConnection;
use crate::error::{message_is_transient, SyncError};
use crate::sqlite::RowData;
use crate::targets::{split_runs, RowOp};

/// Writes change batches to a MySQL target through a bounded pool.
pub struct MySqlWriter {
    name: String,
    config: MySqlConnection,
    pool: Option<Pool>,
    batch_size: usize,
}

impl MySqlWriter {
    pub fn new(name: &str, config: MySqlConnection, batch_size: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            config,
            pool: None,
            batch_size: batch_size.unwrap_or(100),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn connect(&mut self) -> Result<(), SyncError> {
        let constraints = PoolConstraints::new(1, self.config.pool_size.max(1))
            .unwrap_or_else(PoolConstraints::default);
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .db_name(Some(self.config.database.clone()))
            .user(Some(self.config.username.clone()))
            .pass(Some(self.config.password.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints))
            .into();

        let pool = Pool::new(opts);

        // Pool setup is lazy; prove reachability now so startup failures
        // surface before any data moves
        let mut conn = pool.get_conn().await.map_err(|e| SyncError::Reachability {
            target: self.name.clone(),
            message: e.to_string(),
        })?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| SyncError::Reachability {
                target: self.name.clone(),
                message: e.to_string(),
            })?;
        drop(conn);

        self.pool = Some(pool);
        tracing::info!(
            target_name = %self.name,
            host = %self.config.host,
            database = %self.config.database,
            "mysql target connected"
        );
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        if let Some(pool) = self.pool.take() {
            pool.disconnect()
                .await
                .map_err(|e| self.transient(e.to_string()))?;
        }
        tracing::info!(target_name = %self.name, "mysql target disconnected");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| self.transient(e.to_string()))?;
        Ok(())
    }

    /// Apply ops in order. Upsert runs use multi-row `exec_batch`; when a
    /// batch fails it falls back to per-row application so one bad row
    /// does not poison the rest.
    pub async fn apply_batch(
        &self,
        table: &str,
        primary_key: &str,
        ops: &[RowOp],
    ) -> Result<u64, SyncError> {
        if ops.is_empty() {
            return Ok(0);
        }
        let pool = self.pool()?;
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| self.transient(e.to_string()))?;

        let mut applied = 0u64;
        for run in split_runs(ops) {
            match &run[0] {
                RowOp::Upsert(first) => {
                    let columns: Vec<String> = first.keys().cloned().collect();
                    let rows: Vec<&RowData> = run
                        .iter()
                        .map(|op| match op {
                            RowOp::Upsert(row) => row,
                            RowOp::Delete(_) => unreachable!("runs are kind-homogeneous"),
                        })
                        .collect();
                    for chunk in rows.chunks(self.batch_size.max(1)) {
                        applied += self
                            .upsert_chunk(&mut conn, table, primary_key, &columns, chunk)
                            .await?;
                    }
                }
                RowOp::Delete(_) => {
                    let keys: Vec<&PkValue> = run
                        .iter()
                        .map(|op| match op {
                            RowOp::Delete(key) => key,
                            RowOp::Upsert(_) => unreachable!("runs are kind-homogeneous"),
                        })
                        .collect();
                    for chunk in keys.chunks(self.batch_size.max(1)) {
                        let sql = build_delete(table, primary_key, chunk.len());
                        let params: Vec<mysql_async::Value> =
                            chunk.iter().map(|k| pk_to_value(k)).collect();
                        conn.exec_drop(&sql, Params::Positional(params))
                            .await
                            .map_err(|e| self.classify(e, table))?;
                        applied += chunk.len() as u64;
                    }
                }
            }
        }

        tracing::debug!(
            target_name = %self.name,
            table,
            count = applied,
            "mysql batch applied"
        );
        Ok(applied)
    }

    async fn upsert_chunk(
        &self,
        conn: &mut mysql_async::Conn,
        table: &str,
        primary_key: &str,
        columns: &[String],
        rows: &[&RowData],
    ) -> Result<u64, SyncError> {
        let sql = build_upsert(table, columns, primary_key);
        let params: Vec<Params> = rows
            .iter()
            .map(|row| Params::Positional(row_params(row, columns)))
            .collect();

        match conn.exec_batch(&sql, params).await {
            Ok(()) => Ok(rows.len() as u64),
            Err(batch_err) if rows.len() > 1 => {
                tracing::warn!(
                    target_name = %self.name,
                    table,
                    error = %batch_err,
                    "batch upsert failed, retrying row by row"
                );
                let mut applied = 0u64;
                for row in rows {
                    conn.exec_drop(&sql, Params::Positional(row_params(row, columns)))
                        .await
                        .map_err(|e| self.classify_row(e, table, row, primary_key))?;
                    applied += 1;
                }
                Ok(applied)
            }
            Err(e) => Err(self.classify_row(e, table, rows[0], primary_key)),
        }
    }

    fn pool(&self) -> Result<&Pool, SyncError> {
        self.pool.as_ref().ok_or_else(|| SyncError::Reachability {
            target: self.name.clone(),
            message: "not connected".into(),
        })
    }

    fn transient(&self, message: String) -> SyncError {
        SyncError::Transient {
            target: self.name.clone(),
            message,
        }
    }

    fn classify(&self, err: mysql_async::Error, table: &str) -> SyncError {
        let message = err.to_string();
        if message_is_transient(&message) || matches!(err, mysql_async::Error::Io(_)) {
            self.transient(message)
        } else {
            SyncError::Data {
                event_id: table.to_string(),
                message,
            }
        }
    }

    fn classify_row(
        &self,
        err: mysql_async::Error,
        table: &str,
        row: &RowData,
        primary_key: &str,
    ) -> SyncError {
        let message = err.to_string();
        if message_is_transient(&message) || matches!(err, mysql_async::Error::Io(_)) {
            self.transient(message)
        } else {
            let key = row
                .get(primary_key)
                .map(value_display)
                .unwrap_or_else(|| "?".to_string());
            SyncError::Data {
                event_id: format!("{}:{}", table, key),
                message,
            }
        }
    }
}

fn value_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Build the dialect's upsert statement.
///
/// ```sql
/// INSERT INTO `t` (`id`, `name`) VALUES (?, ?)
/// ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)
/// ```
fn build_upsert(table: &str, columns: &[String], primary_key: &str) -> String {
    let column_list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != primary_key)
        .map(|c| format!("{col} = VALUES({col})", col = quote(c)))
        .collect();
    // MySQL requires at least one assignment; a key-only table gets a no-op
    let update_clause = if updates.is_empty() {
        format!("{col} = VALUES({col})", col = quote(primary_key))
    } else {
        updates.join(", ")
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        quote(table),
        column_list.join(", "),
        placeholders,
        update_clause
    )
}

fn build_delete(table: &str, primary_key: &str, count: usize) -> String {
    let placeholders = vec!["?"; count].join(", ");
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quote(table),
        quote(primary_key),
        placeholders
    )
}

fn row_params(row: &RowData, columns: &[String]) -> Vec<mysql_async::Value> {
    columns
        .iter()
        .map(|c| json_to_value(row.get(c).unwrap_or(&serde_json::Value::Null)))
        .collect()
}

fn json_to_value(value: &serde_json::Value) -> mysql_async::Value {
    match value {
        serde_json::Value::Null => mysql_async::Value::NULL,
        serde_json::Value::Bool(b) => mysql_async::Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                mysql_async::Value::from(i)
            } else {
                mysql_async::Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => mysql_async::Value::from(s.clone()),
        other => mysql_async::Value::from(other.to_string()),
    }
}

fn pk_to_value(pk: &PkValue) -> mysql_async::Value {
    match pk {
        PkValue::Int(i) => mysql_async::Value::from(*i),
        PkValue::Text(s) => mysql_async::Value::from(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_statement_shape() {
        let sql = build_upsert(
            "users",
            &["id".to_string(), "name".to_string(), "email".to_string()],
            "id",
        );
        assert!(sql.starts_with("INSERT INTO `users` (`id`, `name`, `email`) VALUES (?, ?, ?)"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains("`name` = VALUES(`name`)"));
        assert!(sql.contains("`email` = VALUES(`email`)"));
        assert!(!sql.contains("`id` = VALUES(`id`)"));
    }

    #[test]
    fn upsert_key_only_table_gets_noop_assignment() {
        let sql = build_upsert("tags", &["id".to_string()], "id");
        assert!(sql.contains("ON DUPLICATE KEY UPDATE `id` = VALUES(`id`)"));
    }

    #[test]
    fn delete_statement_shape() {
        let sql = build_delete("users", "id", 3);
        assert_eq!(sql, "DELETE FROM `users` WHERE `id` IN (?, ?, ?)");
    }

    #[test]
    fn json_value_mapping() {
        assert_eq!(json_to_value(&json!(null)), mysql_async::Value::NULL);
        assert_eq!(json_to_value(&json!(42)), mysql_async::Value::from(42i64));
        assert_eq!(json_to_value(&json!(2.5)), mysql_async::Value::from(2.5f64));
        assert_eq!(
            json_to_value(&json!("hi")),
            mysql_async::Value::from("hi".to_string())
        );
    }

    #[test]
    fn missing_columns_bind_null() {
        let row: RowData = [("id".to_string(), json!(1))].into_iter().collect();
        let params = row_params(&row, &["id".to_string(), "name".to_string()]);
        assert_eq!(params[0], mysql_async::Value::from(1i64));
        assert_eq!(params[1], mysql_async::Value::NULL);
    }
}
