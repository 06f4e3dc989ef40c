// ABOUTME: Baseline backfill via checkpointed seek pagination
// ABOUTME: Pins the handoff id, scans tables in PK order, upserts to all targets

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use rusqlite::Connection;

use crate::capture::sql::quote_ident;
use crate::checkpoint::{CheckpointStatus, CheckpointStore, InitialSyncCheckpoint, PkValue};
use crate::config::{SyncConfig, TableMapping};
use crate::sqlite::RowData;
use crate::targets::{RowOp, TargetWriter};
use crate::transform::Transformer;

/// Alias used to carry the seek cursor when the table has no usable
/// primary key column and pagination falls back to the implicit rowid.
const ROWID_ALIAS: &str = "_seek_rowid";

/// The column a table is scanned by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekKey {
    Column(String),
    RowId,
}

impl SeekKey {
    fn sql_expr(&self) -> String {
        match self {
            SeekKey::Column(name) => quote_ident(name),
            SeekKey::RowId => "rowid".to_string(),
        }
    }
}

/// One fetched page of the seek scan.
struct SeekPage {
    rows: Vec<RowData>,
    last_pk: Option<PkValue>,
}

/// Copies the pre-existing rows of each mapped table to every target.
///
/// The scan uses the seek pattern (`WHERE pk > last ORDER BY pk LIMIT n`)
/// and persists its position so an interrupted backfill resumes instead
/// of restarting. Tables whose effective key is the implicit rowid must
/// not receive concurrent UPDATEs during backfill; rowids are not stable
/// under such interleaving.
pub struct InitialSync<'a> {
    config: &'a SyncConfig,
    targets: &'a [TargetWriter],
    checkpoints: &'a CheckpointStore,
}

impl<'a> InitialSync<'a> {
    pub fn new(
        config: &'a SyncConfig,
        targets: &'a [TargetWriter],
        checkpoints: &'a CheckpointStore,
    ) -> Self {
        Self {
            config,
            targets,
            checkpoints,
        }
    }

    /// Backfill the given tables and return the handoff id: the audit id
    /// pinned before any table was scanned, where the incremental stream
    /// will begin. Changes racing the scan are either visible to it or
    /// sit in the audit log at ids `<= handoff_id` that the incremental
    /// path replays; upsert semantics absorb the overlap.
    pub async fn run(&self, tables: &[String]) -> Result<i64> {
        let conn = crate::sqlite::open_source(&self.config.source.db_path)?;
        let handoff_id = crate::audit::max_audit_id(&conn)?;
        drop(conn);
        self.checkpoints
            .save_handoff_id(&self.config.source.db_path, handoff_id)?;

        tracing::info!(handoff_id, ?tables, "initial sync starting");

        for table in tables {
            let mapping = self
                .config
                .table_mapping(table)
                .with_context(|| format!("table '{}' has no mapping", table))?;
            let synced = match mapping.parallel_ranges.filter(|n| *n > 1) {
                Some(ranges) => self.sync_table_ranged(table, ranges).await?,
                None => self.sync_table(table).await?,
            };
            tracing::info!(table = %table, rows = synced, "initial sync table complete");
        }

        tracing::info!(handoff_id, "initial sync complete");
        Ok(handoff_id)
    }

    /// Backfill one table, resuming from its checkpoint.
    pub async fn sync_table(&self, table: &str) -> Result<u64> {
        let mapping = self
            .config
            .table_mapping(table)
            .with_context(|| format!("table '{}' has no mapping", table))?;
        let source = &self.config.source.db_path;

        if let Some(checkpoint) = self.checkpoints.load_initial_checkpoint(source, table)? {
            if checkpoint.status == CheckpointStatus::Completed {
                tracing::info!(
                    table,
                    total_synced = checkpoint.total_synced,
                    "initial sync already completed, skipping"
                );
                return Ok(checkpoint.total_synced);
            }
        }

        let conn = crate::sqlite::open_source(source)?;
        let columns = crate::sqlite::table_columns(&conn, table)?;
        let seek_key = effective_seek_key(&conn, table, mapping, &columns)?;

        let mut checkpoint = self
            .checkpoints
            .load_initial_checkpoint(source, table)?
            .unwrap_or_else(|| InitialSyncCheckpoint::new(table));
        checkpoint.status = CheckpointStatus::Running;

        tracing::info!(
            table,
            seek_key = %seek_key.sql_expr(),
            resume_from = ?checkpoint.last_pk,
            "initial sync table starting"
        );

        let result = self
            .scan_and_apply(&conn, table, mapping, &columns, &seek_key, &mut checkpoint, None)
            .await;

        match result {
            Ok(synced) => {
                checkpoint.status = CheckpointStatus::Completed;
                checkpoint.updated_at = Utc::now();
                self.checkpoints.save_initial_checkpoint(source, &checkpoint)?;
                Ok(synced)
            }
            Err(err) => {
                checkpoint.status = CheckpointStatus::Failed;
                checkpoint.updated_at = Utc::now();
                self.checkpoints.save_initial_checkpoint(source, &checkpoint)?;
                Err(err)
            }
        }
    }

    /// Range-parallel backfill: partition `[min_pk, max_pk]` into
    /// contiguous ranges and scan them concurrently. Only usable for
    /// integer keys; a failing range does not stop its siblings, and the
    /// table is marked completed only when every range finished.
    pub async fn sync_table_ranged(&self, table: &str, ranges: usize) -> Result<u64> {
        let mapping = self
            .config
            .table_mapping(table)
            .with_context(|| format!("table '{}' has no mapping", table))?;
        let source = &self.config.source.db_path;

        if let Some(checkpoint) = self.checkpoints.load_initial_checkpoint(source, table)? {
            if checkpoint.status == CheckpointStatus::Completed {
                return Ok(checkpoint.total_synced);
            }
        }

        let conn = crate::sqlite::open_source(source)?;
        let columns = crate::sqlite::table_columns(&conn, table)?;
        let seek_key = effective_seek_key(&conn, table, mapping, &columns)?;

        let bounds = integer_key_bounds(&conn, table, &seek_key)?;
        drop(conn);

        let (min_pk, max_pk) = match bounds {
            Some(bounds) => bounds,
            None => {
                // Empty table: nothing to partition
                let mut checkpoint = InitialSyncCheckpoint::new(table);
                checkpoint.status = CheckpointStatus::Completed;
                self.checkpoints.save_initial_checkpoint(source, &checkpoint)?;
                return Ok(0);
            }
        };

        let plan = plan_ranges(min_pk, max_pk, ranges);
        tracing::info!(table, ranges = plan.len(), min_pk, max_pk, "range-parallel backfill");

        let workers = plan.iter().map(|(lo, hi)| {
            let columns = columns.clone();
            let seek_key = seek_key.clone();
            async move {
                let conn = crate::sqlite::open_source(source)?;
                let mut scratch = InitialSyncCheckpoint::new(table);
                // Ranges checkpoint in memory only; the table checkpoint is
                // written when all ranges settle
                scratch.last_pk = Some(PkValue::Int(*lo));
                self.scan_and_apply(
                    &conn,
                    table,
                    mapping,
                    &columns,
                    &seek_key,
                    &mut scratch,
                    Some(PkValue::Int(*hi)),
                )
                .await
            }
        });

        let results = join_all(workers).await;

        let mut synced = 0u64;
        let mut first_error = None;
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(rows) => synced += rows,
                Err(err) => {
                    tracing::error!(table, range = idx, error = %err, "range backfill failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let mut checkpoint = InitialSyncCheckpoint::new(table);
        checkpoint.total_synced = synced;
        checkpoint.updated_at = Utc::now();
        checkpoint.status = if first_error.is_none() {
            CheckpointStatus::Completed
        } else {
            CheckpointStatus::Failed
        };
        self.checkpoints.save_initial_checkpoint(source, &checkpoint)?;

        match first_error {
            None => Ok(synced),
            Some(err) => Err(err),
        }
    }

    /// The seek loop shared by the plain and ranged paths.
    #[allow(clippy::too_many_arguments)]
    async fn scan_and_apply(
        &self,
        conn: &Connection,
        table: &str,
        mapping: &TableMapping,
        columns: &[String],
        seek_key: &SeekKey,
        checkpoint: &mut InitialSyncCheckpoint,
        upper_bound: Option<PkValue>,
    ) -> Result<u64> {
        let transformer = Transformer::new(mapping)?;
        let target_table = transformer.target_table().to_string();
        let target_pk = transformer.target_primary_key().to_string();
        let source = &self.config.source.db_path;

        let mut synced = checkpoint.total_synced;
        let mut batch_num = 0usize;

        loop {
            let page = fetch_page(
                conn,
                table,
                columns,
                seek_key,
                checkpoint.last_pk.as_ref(),
                upper_bound.as_ref(),
                self.config.batch_size,
            )?;

            if page.rows.is_empty() {
                break;
            }
            let fetched = page.rows.len() as u64;

            let transformed = transformer
                .transform_batch(&page.rows)
                .map_err(|e| anyhow::anyhow!("transform failed for '{}': {}", table, e))?;
            let ops: Vec<RowOp> = transformed.into_iter().map(RowOp::Upsert).collect();

            if !ops.is_empty() {
                let applies = self
                    .targets
                    .iter()
                    .map(|target| target.apply_batch(&target_table, &target_pk, &ops));
                for (target, result) in self.targets.iter().zip(join_all(applies).await) {
                    result.with_context(|| {
                        format!(
                            "initial sync batch failed on target '{}' for '{}'",
                            target.name(),
                            table
                        )
                    })?;
                    self.checkpoints.update_stats(
                        source,
                        target.name(),
                        table,
                        "INSERT",
                        ops.len() as u64,
                    )?;
                }
            }

            synced += fetched;
            checkpoint.last_pk = page.last_pk;
            checkpoint.total_synced = synced;
            checkpoint.updated_at = Utc::now();
            batch_num += 1;

            if batch_num % self.config.checkpoint_interval.max(1) == 0 {
                self.checkpoints.save_initial_checkpoint(source, checkpoint)?;
                tracing::debug!(table, synced, last_pk = ?checkpoint.last_pk, "initial sync checkpoint");
            }

            // Yield between pages so shutdown and sibling ranges get a turn
            tokio::task::yield_now().await;
        }

        Ok(synced)
    }
}

/// Resolve the column a table is scanned by.
///
/// Priority: the mapping's key when the table actually has that column,
/// then the declared single-column primary key, then the implicit rowid.
fn effective_seek_key(
    conn: &Connection,
    table: &str,
    mapping: &TableMapping,
    columns: &[String],
) -> Result<SeekKey> {
    if columns.iter().any(|c| c == &mapping.primary_key) {
        return Ok(SeekKey::Column(mapping.primary_key.clone()));
    }
    if let Some(declared) = crate::sqlite::declared_primary_key(conn, table)? {
        return Ok(SeekKey::Column(declared));
    }
    tracing::warn!(
        table,
        "no usable primary key; falling back to rowid pagination"
    );
    Ok(SeekKey::RowId)
}

/// Fetch one page: `WHERE pk > after [AND pk <= upper] ORDER BY pk LIMIT n`.
fn fetch_page(
    conn: &Connection,
    table: &str,
    columns: &[String],
    seek_key: &SeekKey,
    after: Option<&PkValue>,
    upper: Option<&PkValue>,
    limit: usize,
) -> Result<SeekPage> {
    let key_expr = seek_key.sql_expr();
    let select_list = match seek_key {
        SeekKey::Column(_) => "*".to_string(),
        SeekKey::RowId => format!("rowid AS {}, *", ROWID_ALIAS),
    };

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list,
        quote_ident(table)
    );
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    let mut clauses: Vec<String> = Vec::new();
    if let Some(after) = after {
        clauses.push(format!("{} > ?", key_expr));
        params.push(after.to_sql_value());
    }
    if let Some(upper) = upper {
        clauses.push(format!("{} <= ?", key_expr));
        params.push(upper.to_sql_value());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT ?", key_expr));
    params.push(rusqlite::types::Value::Integer(limit as i64));

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("Failed to prepare seek query for '{}'", table))?;

    let offset = match seek_key {
        SeekKey::Column(_) => 0,
        SeekKey::RowId => 1,
    };

    let mut rows_with_cursor: Vec<(RowData, Option<PkValue>)> = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let mut data = RowData::new();
            for (idx, name) in columns.iter().enumerate() {
                data.insert(name.clone(), crate::sqlite::value_to_json(row.get_ref(idx + offset)?));
            }
            let cursor = match seek_key {
                SeekKey::Column(name) => data.get(name).and_then(PkValue::from_json),
                SeekKey::RowId => Some(PkValue::Int(row.get(0)?)),
            };
            Ok((data, cursor))
        })
        .with_context(|| format!("Failed to scan '{}'", table))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed to collect page from '{}'", table))?;

    let last_pk = rows_with_cursor.last().and_then(|(_, cursor)| cursor.clone());
    let rows = rows_with_cursor.drain(..).map(|(data, _)| data).collect();
    Ok(SeekPage { rows, last_pk })
}

/// Integer MIN/MAX of the seek key, or None for an empty table.
fn integer_key_bounds(
    conn: &Connection,
    table: &str,
    seek_key: &SeekKey,
) -> Result<Option<(i64, i64)>> {
    let key_expr = seek_key.sql_expr();
    let sql = format!(
        "SELECT MIN({key}), MAX({key}) FROM {}",
        quote_ident(table),
        key = key_expr
    );
    let bounds: (Option<i64>, Option<i64>) = conn
        .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
        .with_context(|| format!("Failed to read key bounds of '{}' (integer key required)", table))?;
    Ok(match bounds {
        (Some(min), Some(max)) => Some((min, max)),
        _ => None,
    })
}

/// Partition `[min, max]` into at most `n` contiguous `(lo, hi]`-style
/// ranges, expressed as (exclusive lower, inclusive upper) seek bounds.
pub(crate) fn plan_ranges(min: i64, max: i64, n: usize) -> Vec<(i64, i64)> {
    let n = n.max(1) as i64;
    let span = max - min + 1;
    let width = (span + n - 1) / n;
    let mut ranges = Vec::new();
    let mut lo = min - 1; // exclusive lower bound
    while lo < max {
        let hi = (lo + width).min(max);
        ranges.push((lo, hi));
        lo = hi;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMapping;

    fn mapping_for(table: &str, pk: &str) -> TableMapping {
        TableMapping {
            source_table: table.into(),
            target_table: None,
            field_mappings: Vec::<FieldMapping>::new(),
            filter_condition: None,
            primary_key: pk.into(),
            parallel_ranges: None,
        }
    }

    fn seeded(rows: i64) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);
             CREATE TABLE unkeyed (label TEXT);",
        )
        .unwrap();
        for i in 1..=rows {
            conn.execute(
                "INSERT INTO items (id, label) VALUES (?1, ?2)",
                rusqlite::params![i, format!("item-{}", i)],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn seek_key_prefers_mapping_then_declared_then_rowid() {
        let conn = seeded(1);
        let columns = crate::sqlite::table_columns(&conn, "items").unwrap();

        let key = effective_seek_key(&conn, "items", &mapping_for("items", "id"), &columns).unwrap();
        assert_eq!(key, SeekKey::Column("id".into()));

        // Configured key does not exist; declared PK wins
        let key = effective_seek_key(&conn, "items", &mapping_for("items", "nope"), &columns)
            .unwrap();
        assert_eq!(key, SeekKey::Column("id".into()));

        let columns = crate::sqlite::table_columns(&conn, "unkeyed").unwrap();
        let key = effective_seek_key(&conn, "unkeyed", &mapping_for("unkeyed", "id"), &columns)
            .unwrap();
        assert_eq!(key, SeekKey::RowId);
    }

    #[test]
    fn seek_pagination_visits_every_row_once() {
        let conn = seeded(1000);
        let columns = crate::sqlite::table_columns(&conn, "items").unwrap();
        let key = SeekKey::Column("id".into());

        let mut last_pk: Option<PkValue> = None;
        let mut pages = 0;
        let mut total = 0;
        let mut previous_cursor = 0i64;

        loop {
            let page = fetch_page(&conn, "items", &columns, &key, last_pk.as_ref(), None, 100)
                .unwrap();
            if page.rows.is_empty() {
                break;
            }
            pages += 1;
            total += page.rows.len();

            // Cursor must be strictly increasing across pages
            if let Some(PkValue::Int(cursor)) = &page.last_pk {
                assert!(*cursor > previous_cursor);
                previous_cursor = *cursor;
            } else {
                panic!("integer cursor expected");
            }
            last_pk = page.last_pk;
        }

        assert_eq!(pages, 10);
        assert_eq!(total, 1000);
        assert_eq!(previous_cursor, 1000);
    }

    #[test]
    fn seek_respects_upper_bound() {
        let conn = seeded(50);
        let columns = crate::sqlite::table_columns(&conn, "items").unwrap();
        let key = SeekKey::Column("id".into());

        let page = fetch_page(
            &conn,
            "items",
            &columns,
            &key,
            Some(&PkValue::Int(10)),
            Some(&PkValue::Int(20)),
            100,
        )
        .unwrap();
        assert_eq!(page.rows.len(), 10);
        assert_eq!(page.last_pk, Some(PkValue::Int(20)));
    }

    #[test]
    fn rowid_fallback_excludes_alias_from_rows() {
        let conn = seeded(0);
        conn.execute_batch(
            "INSERT INTO unkeyed (label) VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
        let columns = crate::sqlite::table_columns(&conn, "unkeyed").unwrap();

        let page = fetch_page(&conn, "unkeyed", &columns, &SeekKey::RowId, None, None, 2).unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.last_pk, Some(PkValue::Int(2)));
        assert!(!page.rows[0].contains_key(ROWID_ALIAS));
        assert_eq!(page.rows[0]["label"], serde_json::json!("a"));
    }

    #[test]
    fn range_plan_covers_span_without_overlap() {
        let ranges = plan_ranges(1, 100, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], (0, 25));
        assert_eq!(ranges[3], (75, 100));

        // Contiguity: each upper bound is the next exclusive lower bound
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn range_plan_handles_tiny_spans() {
        let ranges = plan_ranges(5, 5, 8);
        assert_eq!(ranges, vec![(4, 5)]);

        let ranges = plan_ranges(1, 3, 2);
        assert_eq!(ranges, vec![(0, 2), (2, 3)]);
    }

    #[test]
    fn integer_bounds() {
        let conn = seeded(10);
        let bounds = integer_key_bounds(&conn, "items", &SeekKey::Column("id".into())).unwrap();
        assert_eq!(bounds, Some((1, 10)));

        let conn = seeded(0);
        let bounds = integer_key_bounds(&conn, "items", &SeekKey::Column("id".into())).unwrap();
        assert_eq!(bounds, None);
    }
}
