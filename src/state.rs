// ABOUTME: Runtime status snapshot exposed by the sync engine
// ABOUTME: Engine state machine states plus per-target and per-table accounting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Engine lifecycle states.
///
/// `Failed` is absorbing: it is entered when a non-retryable error
/// exhausts the retry policy and only a restart leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    InitialSyncing,
    Incremental,
    Stopping,
    Stopped,
    Failed,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EngineState::InitialSyncing | EngineState::Incremental | EngineState::Stopping
        )
    }
}

/// Per-table operation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub events: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Per-target view for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStatus {
    pub name: String,
    pub last_audit_id: i64,
    /// Audit rows this target has not yet applied
    pub lag_events: u64,
    pub healthy: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl TargetStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_audit_id: 0,
            lag_events: 0,
            healthy: true,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Snapshot returned by `SyncEngine::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: EngineState,
    pub source_db: String,
    pub targets: Vec<TargetStatus>,
    pub total_events: u64,
    pub events_per_second: f64,
    /// Unconsumed audit rows past the reader cursor
    pub backlog: u64,
    pub table_stats: HashMap<String, TableStats>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn new(source_db: &str, target_names: &[String]) -> Self {
        Self {
            state: EngineState::Idle,
            source_db: source_db.to_string(),
            targets: target_names.iter().map(|n| TargetStatus::new(n)).collect(),
            total_events: 0,
            events_per_second: 0.0,
            backlog: 0,
            table_stats: HashMap::new(),
            last_error: None,
            last_error_at: None,
        }
    }

    pub fn target_mut(&mut self, name: &str) -> Option<&mut TargetStatus> {
        self.targets.iter_mut().find(|t| t.name == name)
    }

    pub fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
    }

    /// Bump the per-table counters for one applied event.
    pub fn record_event(&mut self, table: &str, operation: crate::audit::Operation) {
        let stats = self.table_stats.entry(table.to_string()).or_default();
        stats.events += 1;
        match operation {
            crate::audit::Operation::Insert => stats.inserts += 1,
            crate::audit::Operation::Update => stats.updates += 1,
            crate::audit::Operation::Delete => stats.deletes += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Operation;

    #[test]
    fn state_running_predicate() {
        assert!(EngineState::Incremental.is_running());
        assert!(EngineState::InitialSyncing.is_running());
        assert!(EngineState::Stopping.is_running());
        assert!(!EngineState::Idle.is_running());
        assert!(!EngineState::Stopped.is_running());
        assert!(!EngineState::Failed.is_running());
    }

    #[test]
    fn event_counters() {
        let mut status = SyncStatus::new("/data/app.db", &["t".to_string()]);
        status.record_event("users", Operation::Insert);
        status.record_event("users", Operation::Update);
        status.record_event("users", Operation::Update);
        status.record_event("orders", Operation::Delete);

        let users = &status.table_stats["users"];
        assert_eq!(users.events, 3);
        assert_eq!(users.inserts, 1);
        assert_eq!(users.updates, 2);
        assert_eq!(status.table_stats["orders"].deletes, 1);
    }

    #[test]
    fn error_recording() {
        let mut status = SyncStatus::new("/data/app.db", &[]);
        assert!(status.last_error.is_none());
        status.record_error("boom");
        assert_eq!(status.last_error.as_deref(), Some("boom"));
        assert!(status.last_error_at.is_some());
    }
}
