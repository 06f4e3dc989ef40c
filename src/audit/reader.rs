// ABOUTME: Ordered, resumable reader over the audit table
// ABOUTME: Polls unconsumed rows in id order; the cursor advances only on mark_consumed

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;

use crate::audit::{parse_timestamp, AuditRecord, ChangeEvent, Operation, AUDIT_TABLE};

/// Snapshot of audit-table accounting.
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    pub total: u64,
    pub unconsumed: u64,
    pub max_id: i64,
    pub cursor: i64,
    /// Rows past the cursor still awaiting delivery
    pub backlog: u64,
}

/// Polls the audit table and yields change events in ascending id order.
///
/// The read cursor moves only when the caller acknowledges delivery via
/// `mark_consumed`; a crash between fetch and apply simply re-delivers,
/// and the idempotent apply path downstream absorbs the replay. Consumed
/// rows are retained; pruning them is an operator concern.
pub struct AuditReader {
    conn: Connection,
    batch_size: usize,
    poll_interval: Duration,
    cursor: i64,
    running: bool,
}

impl AuditReader {
    pub fn new(conn: Connection, batch_size: usize, poll_interval: Duration) -> Self {
        Self {
            conn,
            batch_size,
            poll_interval,
            cursor: 0,
            running: false,
        }
    }

    /// Open a dedicated read connection to the source database.
    pub fn open(db_path: &str, batch_size: usize, poll_interval: Duration) -> Result<Self> {
        let conn = crate::sqlite::open_source(db_path)?;
        Ok(Self::new(conn, batch_size, poll_interval))
    }

    /// Begin reading from the given floor: only ids strictly above
    /// `from_id` are yielded.
    pub fn start(&mut self, from_id: i64) {
        self.cursor = from_id;
        self.running = true;
        tracing::info!(
            from_id,
            batch_size = self.batch_size,
            "audit reader started"
        );
    }

    pub fn stop(&mut self) {
        self.running = false;
        tracing::info!("audit reader stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Widen or narrow the fetch size; used by the engine's backpressure
    /// handling.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch up to `batch_size` unconsumed events with `id > cursor`.
    ///
    /// Returns an empty vector after sleeping `poll_interval` when there
    /// is nothing to read. The sleep is the suspension point: callers that
    /// select against a shutdown signal cancel here, leaving the cursor
    /// untouched. A full batch returns immediately, allowing an adaptive
    /// re-fetch without the poll delay.
    pub async fn fetch_batch(&mut self) -> Result<Vec<ChangeEvent>> {
        if !self.running {
            return Ok(Vec::new());
        }

        let records = self.fetch_unconsumed()?;
        if records.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
            return Ok(Vec::new());
        }

        let events: Vec<ChangeEvent> = records.iter().map(AuditRecord::to_change_event).collect();
        tracing::debug!(
            count = events.len(),
            first_id = events.first().map(|e| e.audit_id),
            last_id = events.last().map(|e| e.audit_id),
            "audit batch fetched"
        );
        Ok(events)
    }

    fn fetch_unconsumed(&self) -> Result<Vec<AuditRecord>> {
        let query = format!(
            "SELECT id, table_name, operation, row_id, before_data, after_data,
                    created_at, consumed_at, retry_count
             FROM {}
             WHERE id > ?1 AND consumed_at IS NULL
             ORDER BY id
             LIMIT ?2",
            AUDIT_TABLE
        );

        let mut stmt = self
            .conn
            .prepare(&query)
            .context("Failed to prepare audit fetch")?;

        let records = stmt
            .query_map(
                rusqlite::params![self.cursor, self.batch_size as i64],
                decode_record,
            )
            .context("Failed to query unconsumed audit rows")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to decode audit rows")?;

        Ok(records)
    }

    /// Stamp the given audit rows consumed and advance the cursor to the
    /// highest acknowledged id.
    pub fn mark_consumed(&mut self, audit_ids: &[i64]) -> Result<()> {
        if audit_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; audit_ids.len()].join(", ");
        let query = format!(
            "UPDATE {} SET consumed_at = ?1 WHERE id IN ({})",
            AUDIT_TABLE,
            placeholders
        );

        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::from(Utc::now().to_rfc3339())];
        params.extend(audit_ids.iter().map(|id| rusqlite::types::Value::from(*id)));

        self.conn
            .execute(&query, rusqlite::params_from_iter(params.iter()))
            .context("Failed to mark audit rows consumed")?;

        if let Some(max) = audit_ids.iter().max() {
            if *max > self.cursor {
                self.cursor = *max;
            }
        }

        tracing::debug!(count = audit_ids.len(), cursor = self.cursor, "audit rows consumed");
        Ok(())
    }

    /// Move the cursor forward without stamping anything consumed.
    ///
    /// Used when a halted target must not pin delivery for the others:
    /// the skipped rows keep `consumed_at IS NULL`, so a run that later
    /// resumes from the halted target's checkpoint still replays them.
    pub fn advance_cursor(&mut self, to: i64) {
        if to > self.cursor {
            self.cursor = to;
        }
    }

    /// Bump the retry counter on rows that failed to apply.
    pub fn increment_retry(&self, audit_ids: &[i64]) -> Result<()> {
        if audit_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; audit_ids.len()].join(", ");
        let query = format!(
            "UPDATE {} SET retry_count = retry_count + 1 WHERE id IN ({})",
            AUDIT_TABLE, placeholders
        );
        let params: Vec<rusqlite::types::Value> = audit_ids
            .iter()
            .map(|id| rusqlite::types::Value::from(*id))
            .collect();
        self.conn
            .execute(&query, rusqlite::params_from_iter(params.iter()))
            .context("Failed to increment retry counts")?;
        Ok(())
    }

    /// Audit-table accounting for status output and backpressure.
    pub fn stats(&self) -> Result<AuditStats> {
        let total: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", AUDIT_TABLE), [], |r| {
                r.get(0)
            })
            .context("Failed to count audit rows")?;
        let unconsumed: i64 = self
            .conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE consumed_at IS NULL",
                    AUDIT_TABLE
                ),
                [],
                |r| r.get(0),
            )
            .context("Failed to count unconsumed audit rows")?;
        let max_id = crate::audit::max_audit_id(&self.conn)?;

        Ok(AuditStats {
            total: total as u64,
            unconsumed: unconsumed as u64,
            max_id,
            cursor: self.cursor,
            backlog: (max_id - self.cursor).max(0) as u64,
        })
    }
}

fn decode_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let operation_raw: String = row.get(2)?;
    let operation = Operation::parse(&operation_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown operation '{}'", operation_raw).into(),
        )
    })?;

    let before_raw: Option<String> = row.get(4)?;
    let after_raw: Option<String> = row.get(5)?;
    let created_raw: String = row.get(6)?;
    let consumed_raw: Option<String> = row.get(7)?;

    Ok(AuditRecord {
        id: row.get(0)?,
        table_name: row.get(1)?,
        operation,
        row_id: row.get(3)?,
        before_data: before_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        after_data: after_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: parse_timestamp(&created_raw),
        consumed_at: consumed_raw.as_deref().map(parse_timestamp),
        retry_count: row.get::<_, i64>(8)? as u32,
    })
}
