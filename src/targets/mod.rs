// ABOUTME: Target writer dispatch over the supported dialects
// ABOUTME: RowOp batches applied idempotently to MySQL or Oracle

pub mod mysql;
pub mod oracle;

pub use mysql::MySqlWriter;
pub use oracle::OracleWriter;

use crate::checkpoint::PkValue;
use crate::config::{TargetConfig, TargetConnection};
use crate::error::SyncError;
use crate::sqlite::RowData;

/// One idempotent operation against a target table.
#[derive(Debug, Clone)]
pub enum RowOp {
    /// Insert-or-update keyed by the mapping's primary key
    Upsert(RowData),
    /// Delete by primary-key value
    Delete(PkValue),
}

/// A connected replication target.
///
/// Dialect differences are a closed variant; every dialect offers the
/// same capability set (connect, disconnect, apply_batch, ping). The
/// retry budget lives in the engine; writers report classified errors
/// and do not retry on their own.
pub enum TargetWriter {
    MySql(MySqlWriter),
    Oracle(OracleWriter),
}

impl TargetWriter {
    /// Build an unconnected writer from configuration.
    pub fn from_config(config: &TargetConfig) -> Result<Self, SyncError> {
        match &config.connection {
            TargetConnection::Mysql(conn) => Ok(TargetWriter::MySql(MySqlWriter::new(
                &config.name,
                conn.clone(),
                config.batch_size,
            ))),
            TargetConnection::Oracle(conn) => Ok(TargetWriter::Oracle(OracleWriter::new(
                &config.name,
                conn.clone(),
                config.batch_size,
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TargetWriter::MySql(w) => w.name(),
            TargetWriter::Oracle(w) => w.name(),
        }
    }

    pub async fn connect(&mut self) -> Result<(), SyncError> {
        match self {
            TargetWriter::MySql(w) => w.connect().await,
            TargetWriter::Oracle(w) => w.connect().await,
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        match self {
            TargetWriter::MySql(w) => w.disconnect().await,
            TargetWriter::Oracle(w) => w.disconnect().await,
        }
    }

    /// Liveness probe against a pooled connection.
    pub async fn ping(&self) -> Result<(), SyncError> {
        match self {
            TargetWriter::MySql(w) => w.ping().await,
            TargetWriter::Oracle(w) => w.ping().await,
        }
    }

    /// Apply a batch of operations in order.
    ///
    /// Atomic per op and idempotent over the whole batch: re-applying the
    /// same batch leaves the target in the same state.
    pub async fn apply_batch(
        &self,
        table: &str,
        primary_key: &str,
        ops: &[RowOp],
    ) -> Result<u64, SyncError> {
        match self {
            TargetWriter::MySql(w) => w.apply_batch(table, primary_key, ops).await,
            TargetWriter::Oracle(w) => w.apply_batch(table, primary_key, ops).await,
        }
    }
}

/// Split an op sequence into same-kind runs whose upserts share a column
/// set, preserving order. Each run can go to the target as one statement
/// batch without reordering two ops for the same row.
pub(crate) fn split_runs(ops: &[RowOp]) -> Vec<&[RowOp]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=ops.len() {
        let boundary = i == ops.len()
            || match (&ops[i - 1], &ops[i]) {
                (RowOp::Upsert(a), RowOp::Upsert(b)) => {
                    !a.keys().eq(b.keys())
                }
                (RowOp::Delete(_), RowOp::Delete(_)) => false,
                _ => true,
            };
        if boundary {
            runs.push(&ops[start..i]);
            start = i;
        }
    }
    runs
}
