// ABOUTME: Oracle target writer
// ABOUTME: Row-by-row MERGE INTO upserts driven through spawn_blocking

use std::sync::Arc;

use oracle::pool::{Pool, PoolBuilder};
use oracle::sql_type::ToSql;

use crate::checkpoint::PkValue;
use crate::config::OracleConnection;
use crate::error::{message_is_transient, SyncError};
use crate::sqlite::RowData;
use crate::targets::RowOp;

/// Writes change batches to an Oracle target.
///
/// The Oracle driver is blocking, so every database call runs on the
/// blocking thread pool. Upserts use MERGE row by row; multi-row MERGE
/// buys little here and complicates bind handling considerably.
pub struct OracleWriter {
    name: String,
    config: OracleConnection,
    pool: Option<Arc<Pool>>,
    batch_size: usize,
}

impl OracleWriter {
    pub fn new(name: &str, config: OracleConnection, batch_size: Option<usize>) -> Self {
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

    fn connect_string(&self) -> String {
        format!(
            "//{}:{}/{}",
            self.config.host, self.config.port, self.config.service_name
        )
    }

    pub async fn connect(&mut self) -> Result<(), SyncError> {
        let username = self.config.username.clone();
        let password = self.config.password.clone();
        let connect_string = self.connect_string();
        let pool_size = self.config.pool_size.max(1) as u32;
        let target = self.name.clone();

        let pool = tokio::task::spawn_blocking(move || {
            let pool = PoolBuilder::new(username, password, connect_string)
                .min_connections(1)
                .max_connections(pool_size)
                .build()?;
            // Prove reachability before reporting success
            let conn = pool.get()?;
            conn.query_row_as::<i64>("SELECT 1 FROM dual", &[])?;
            Ok::<_, oracle::Error>(pool)
        })
        .await
        .map_err(|e| SyncError::Transient {
            target: target.clone(),
            message: format!("blocking task failed: {}", e),
        })?
        .map_err(|e| SyncError::Reachability {
            target: target.clone(),
            message: e.to_string(),
        })?;

        self.pool = Some(Arc::new(pool));
        tracing::info!(
            target_name = %self.name,
            host = %self.config.host,
            service_name = %self.config.service_name,
            "oracle target connected"
        );
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        // Dropping the pool closes its connections
        self.pool = None;
        tracing::info!(target_name = %self.name, "oracle target disconnected");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        let pool = self.pool()?;
        let target = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.query_row_as::<i64>("SELECT 1 FROM dual", &[])?;
            Ok::<_, oracle::Error>(())
        })
        .await
        .map_err(|e| SyncError::Transient {
            target: target.clone(),
            message: format!("blocking task failed: {}", e),
        })?
        .map_err(|e| SyncError::Transient {
            target,
            message: e.to_string(),
        })
    }

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
        let target = self.name.clone();
        let table_name = table.to_string();
        let primary_key = primary_key.to_string();
        let ops: Vec<RowOp> = ops.to_vec();
        let commit_every = self.batch_size.max(1);

        let applied = tokio::task::spawn_blocking(move || {
            apply_blocking(&pool, &target, &table_name, &primary_key, &ops, commit_every)
        })
        .await
        .map_err(|e| SyncError::Transient {
            target: self.name.clone(),
            message: format!("blocking task failed: {}", e),
        })??;

        tracing::debug!(
            target_name = %self.name,
            table = %table,
            count = applied,
            "oracle batch applied"
        );
        Ok(applied)
    }

    fn pool(&self) -> Result<Arc<Pool>, SyncError> {
        self.pool.clone().ok_or_else(|| SyncError::Reachability {
            target: self.name.clone(),
            message: "not connected".into(),
        })
    }
}

fn apply_blocking(
    pool: &Pool,
    target: &str,
    table: &str,
    primary_key: &str,
    ops: &[RowOp],
    commit_every: usize,
) -> Result<u64, SyncError> {
    let classify = |message: String, event: String| {
        if message_is_transient(&message) {
            SyncError::Transient {
                target: target.to_string(),
                message,
            }
        } else {
            SyncError::Data {
                event_id: event,
                message,
            }
        }
    };

    let conn = pool.get().map_err(|e| SyncError::Transient {
        target: target.to_string(),
        message: e.to_string(),
    })?;

    let mut applied = 0u64;
    for op in ops {
        match op {
            RowOp::Upsert(row) => {
                let columns: Vec<&String> = row.keys().collect();
                let sql = build_merge(table, &columns, primary_key);
                let params = row_params(row, &columns);
                let param_refs: Vec<&dyn ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                conn.execute(&sql, &param_refs).map_err(|e| {
                    let key = row
                        .get(primary_key)
                        .map(value_display)
                        .unwrap_or_else(|| "?".to_string());
                    classify(e.to_string(), format!("{}:{}", table, key))
                })?;
            }
            RowOp::Delete(key) => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = :1",
                    quote(table),
                    quote(primary_key)
                );
                let param: Box<dyn ToSql> = pk_param(key);
                conn.execute(&sql, &[param.as_ref()])
                    .map_err(|e| classify(e.to_string(), format!("{}:{}", table, key)))?;
            }
        }
        applied += 1;
        if applied as usize % commit_every == 0 {
            conn.commit().map_err(|e| SyncError::Transient {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        }
    }

    conn.commit().map_err(|e| SyncError::Transient {
        target: target.to_string(),
        message: e.to_string(),
    })?;

    Ok(applied)
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a primary-key value for error hints without JSON quoting, the
/// same way the MySQL writer does.
fn value_display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the dialect's upsert statement.
///
/// ```sql
/// MERGE INTO "t" t
/// USING (SELECT :1 "id", :2 "name" FROM dual) s
/// ON (t."id" = s."id")
/// WHEN MATCHED THEN UPDATE SET t."name" = s."name"
/// WHEN NOT MATCHED THEN INSERT ("id", "name") VALUES (s."id", s."name")
/// ```
fn build_merge(table: &str, columns: &[&String], primary_key: &str) -> String {
    let using: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(idx, col)| format!(":{} {}", idx + 1, quote(col)))
        .collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != primary_key)
        .map(|c| format!("t.{col} = s.{col}", col = quote(c)))
        .collect();
    let matched_clause = if updates.is_empty() {
        // All columns are the key; a MATCHED branch would be a no-op
        String::new()
    } else {
        format!("WHEN MATCHED THEN UPDATE SET {} ", updates.join(", "))
    };

    let insert_cols: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    let insert_vals: Vec<String> = columns.iter().map(|c| format!("s.{}", quote(c))).collect();

    format!(
        "MERGE INTO {table} t USING (SELECT {using} FROM dual) s ON (t.{pk} = s.{pk}) \
         {matched}WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({vals})",
        table = quote(table),
        using = using.join(", "),
        pk = quote(primary_key),
        matched = matched_clause,
        cols = insert_cols.join(", "),
        vals = insert_vals.join(", ")
    )
}

fn row_params(row: &RowData, columns: &[&String]) -> Vec<Box<dyn ToSql>> {
    columns
        .iter()
        .map(|col| json_param(row.get(col.as_str()).unwrap_or(&serde_json::Value::Null)))
        .collect()
}

fn json_param(value: &serde_json::Value) -> Box<dyn ToSql> {
    match value {
        serde_json::Value::Null => Box::new(None::<String>),
        // Oracle has no native boolean column type in common schemas
        serde_json::Value::Bool(b) => Box::new(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

fn pk_param(pk: &PkValue) -> Box<dyn ToSql> {
    match pk {
        PkValue::Int(i) => Box::new(*i),
        PkValue::Text(s) => Box::new(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_statement_shape() {
        let id = "id".to_string();
        let name = "name".to_string();
        let sql = build_merge("users", &[&id, &name], "id");
        assert!(sql.starts_with("MERGE INTO \"users\" t"));
        assert!(sql.contains("USING (SELECT :1 \"id\", :2 \"name\" FROM dual) s"));
        assert!(sql.contains("ON (t.\"id\" = s.\"id\")"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET t.\"name\" = s.\"name\""));
        assert!(sql.contains(
            "WHEN NOT MATCHED THEN INSERT (\"id\", \"name\") VALUES (s.\"id\", s.\"name\")"
        ));
    }

    #[test]
    fn merge_key_only_table_skips_matched_branch() {
        let id = "id".to_string();
        let sql = build_merge("tags", &[&id], "id");
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT"));
    }
}
