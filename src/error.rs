// ABOUTME: Error classification for sync operations
// ABOUTME: Distinguishes retryable faults from data errors and fatal startup failures

use thiserror::Error;

/// Classified sync error.
///
/// The engine routes errors by kind: configuration and reachability errors
/// are fatal at startup, transient errors go through the retry policy, data
/// errors are recorded and either skipped or halt the target, and capture
/// errors roll the originating transaction back.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed configuration, missing source, unknown table, invalid converter.
    #[error("configuration error: {0}")]
    Config(String),

    /// Target unreachable. Fatal during validate/startup, retryable at runtime.
    #[error("target '{target}' unreachable: {message}")]
    Reachability { target: String, message: String },

    /// Network blip, deadlock, lock wait. Retryable with backoff.
    #[error("transient error on '{target}': {message}")]
    Transient { target: String, message: String },

    /// Type mismatch, converter failure, target schema mismatch. Not retryable.
    #[error("data error for event {event_id}: {message}")]
    Data { event_id: String, message: String },

    /// The business write and its audit rows could not commit together.
    #[error("capture failed on table '{table}': {message}")]
    Capture { table: String, message: String },
}

impl SyncError {
    /// Whether the engine should retry this error under the target's policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient { .. } | SyncError::Reachability { .. }
        )
    }

    /// Short kind label recorded in the `sync_errors` table.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config",
            SyncError::Reachability { .. } => "reachability",
            SyncError::Transient { .. } => "transient",
            SyncError::Data { .. } => "data",
            SyncError::Capture { .. } => "capture",
        }
    }
}

/// Classify a driver error message as transient or not.
///
/// Driver crates surface connection-level faults as strings; this is the
/// same keyword screen the targets apply before reporting upward.
pub fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "connection",
        "timeout",
        "timed out",
        "closed",
        "reset",
        "refused",
        "broken pipe",
        "network",
        "temporar",
        "deadlock",
        "lock wait",
        "too many connections",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_reachability_are_retryable() {
        let err = SyncError::Transient {
            target: "mysql_prod".into(),
            message: "connection reset by peer".into(),
        };
        assert!(err.is_retryable());

        let err = SyncError::Reachability {
            target: "oracle_dr".into(),
            message: "refused".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn data_and_config_are_not_retryable() {
        let err = SyncError::Data {
            event_id: "7:users:1".into(),
            message: "cannot cast 'abc' to int".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "data");

        assert!(!SyncError::Config("missing source".into()).is_retryable());
    }

    #[test]
    fn transient_message_screen() {
        assert!(message_is_transient("Lost connection to MySQL server"));
        assert!(message_is_transient("ORA-03135: connection lost contact"));
        assert!(message_is_transient("Deadlock found when trying to get lock"));
        assert!(!message_is_transient("Unknown column 'emailx' in field list"));
    }
}
