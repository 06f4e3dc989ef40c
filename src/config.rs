// ABOUTME: Sync configuration model and YAML loader
// ABOUTME: Supports ${VAR} / ${VAR:-default} environment interpolation at load time

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Source SQLite database configuration.
///
/// CDC requires the source to run in WAL journal mode so the wrapper's
/// writes and the reader's polling can proceed concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    /// Journal mode; must be WAL
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    /// Tables to capture (empty = all tables)
    #[serde(default)]
    pub tables: Vec<String>,
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

/// Retry policy for a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff, in seconds
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Cap on a single backoff delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_delay() -> u64 {
    60
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
        }
    }
}

/// What to do when a target hits a non-retryable data error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataErrorPolicy {
    /// Record the error and stop applying to this target
    #[default]
    Halt,
    /// Record the error and move on to the next event
    Skip,
}

/// Target database kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Mysql,
    Oracle,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Mysql => write!(f, "mysql"),
            TargetKind::Oracle => write!(f, "oracle"),
        }
    }
}

/// MySQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlConnection {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_pool_size() -> usize {
    5
}

/// Oracle connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConnection {
    pub host: String,
    #[serde(default = "default_oracle_port")]
    pub port: u16,
    pub service_name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_oracle_port() -> u16 {
    1521
}

/// Connection parameters, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetConnection {
    Mysql(MySqlConnection),
    Oracle(OracleConnection),
}

impl TargetConnection {
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetConnection::Mysql(_) => TargetKind::Mysql,
            TargetConnection::Oracle(_) => TargetKind::Oracle,
        }
    }
}

/// One replication target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique name identifying this target in checkpoints and logs
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub connection: TargetConnection,
    /// Per-target batch size override
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub on_data_error: DataErrorPolicy,
}

/// Field value converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    Lowercase,
    Uppercase,
    Trim,
    Default,
    Typecast,
}

/// Field-level mapping: rename and/or convert one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    /// Target field name; defaults to the source name
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub converter: Option<ConverterKind>,
    #[serde(default)]
    pub converter_params: BTreeMap<String, serde_json::Value>,
}

impl FieldMapping {
    pub fn target_name(&self) -> &str {
        self.target_field.as_deref().unwrap_or(&self.source_field)
    }
}

/// Table-level mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table: String,
    /// Target table name; defaults to the source name
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    /// Row-level filter, e.g. `deleted_at IS NULL`
    #[serde(default)]
    pub filter_condition: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Backfill this table with N concurrent key ranges (integer PK only)
    #[serde(default)]
    pub parallel_ranges: Option<usize>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl TableMapping {
    pub fn target_name(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.source_table)
    }
}

/// Root sync configuration. Built at startup and frozen for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: SqliteConfig,
    pub targets: Vec<TargetConfig>,
    pub mappings: Vec<TableMapping>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ceiling for backpressure widening of the batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Flush initial-sync checkpoints every N batches
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Audit poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-attempt timeout for a target batch apply, in seconds
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
    /// Grace period for draining on shutdown, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Unconsumed-audit backlog above which the batch size widens
    #[serde(default = "default_backlog_threshold")]
    pub backlog_threshold: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the checkpoint metadata database
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_apply_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_backlog_threshold() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".")
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Path of the checkpoint metadata database file.
    pub fn checkpoint_db_path(&self) -> PathBuf {
        self.checkpoint_dir.join("checkpoints.db")
    }

    pub fn table_mapping(&self, source_table: &str) -> Option<&TableMapping> {
        self.mappings
            .iter()
            .find(|m| m.source_table == source_table)
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Structural validation beyond what serde enforces.
    fn validate(&self) -> Result<(), SyncError> {
        if self.source.db_path.is_empty() {
            return Err(SyncError::Config("source.db_path must not be empty".into()));
        }
        if !self.source.journal_mode.eq_ignore_ascii_case("wal") {
            return Err(SyncError::Config(format!(
                "source.journal_mode must be WAL, got '{}'",
                self.source.journal_mode
            )));
        }
        if self.targets.is_empty() {
            return Err(SyncError::Config("at least one target is required".into()));
        }
        if self.mappings.is_empty() {
            return Err(SyncError::Config("at least one mapping is required".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.max_batch_size < self.batch_size {
            return Err(SyncError::Config(format!(
                "max_batch_size ({}) must be >= batch_size ({})",
                self.max_batch_size, self.batch_size
            )));
        }

        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            if target.name.is_empty()
                || !target
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(SyncError::Config(format!(
                    "target name '{}' must be non-empty alphanumeric/underscore",
                    target.name
                )));
            }
            if !names.insert(target.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if target.kind != target.connection.kind() {
                return Err(SyncError::Config(format!(
                    "target '{}' declares type {} but its connection is {}",
                    target.name,
                    target.kind,
                    target.connection.kind()
                )));
            }
        }

        if !self.source.tables.is_empty() {
            for mapping in &self.mappings {
                if !self.source.tables.contains(&mapping.source_table) {
                    return Err(SyncError::Config(format!(
                        "mapping for '{}' is not listed in source.tables",
                        mapping.source_table
                    )));
                }
            }
        }

        for mapping in &self.mappings {
            for field in &mapping.field_mappings {
                if field.converter == Some(ConverterKind::Default)
                    && !field.converter_params.contains_key("value")
                {
                    return Err(SyncError::Config(format!(
                        "field '{}.{}': default converter requires a 'value' param",
                        mapping.source_table, field.source_field
                    )));
                }
                if field.converter == Some(ConverterKind::Typecast) {
                    match field.converter_params.get("target_type") {
                        Some(serde_json::Value::String(t))
                            if matches!(t.as_str(), "int" | "float" | "str" | "bool") => {}
                        _ => {
                            return Err(SyncError::Config(format!(
                                "field '{}.{}': typecast requires target_type in int/float/str/bool",
                                mapping.source_table, field.source_field
                            )))
                        }
                    }
                }
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(SyncError::Config(format!(
                "log_level must be one of {:?}, got '{}'",
                valid_levels, self.log_level
            )));
        }

        Ok(())
    }
}

/// Load and validate a YAML configuration file.
pub fn load_config(path: &Path) -> Result<SyncConfig, SyncError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    load_config_from_str(&content)
}

/// Load a configuration from a YAML string.
pub fn load_config_from_str(content: &str) -> Result<SyncConfig, SyncError> {
    let raw: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| SyncError::Config(format!("YAML parse failed: {}", e)))?;
    let expanded = expand_env_vars(raw)?;
    let config: SyncConfig = serde_yaml::from_value(expanded)
        .map_err(|e| SyncError::Config(format!("invalid configuration: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Recursively expand `${VAR}` / `${VAR:-default}` in every string value.
fn expand_env_vars(value: serde_yaml::Value) -> Result<serde_yaml::Value, SyncError> {
    match value {
        serde_yaml::Value::String(s) => Ok(serde_yaml::Value::String(expand_string(&s)?)),
        serde_yaml::Value::Sequence(seq) => Ok(serde_yaml::Value::Sequence(
            seq.into_iter()
                .map(expand_env_vars)
                .collect::<Result<_, _>>()?,
        )),
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(k, expand_env_vars(v)?);
            }
            Ok(serde_yaml::Value::Mapping(out))
        }
        other => Ok(other),
    }
}

fn expand_string(input: &str) -> Result<String, SyncError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or_else(|| {
            SyncError::Config(format!("unterminated ${{...}} in '{}'", input))
        })?;
        let expr = &tail[..end];

        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => {
                    return Err(SyncError::Config(format!(
                        "environment variable '{}' is not set and has no default",
                        name
                    )))
                }
            },
        }

        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// YAML template emitted by `cdc-replicator init`.
pub fn config_template() -> &'static str {
    r#"# cdc-replicator configuration

# Source SQLite database (must use WAL journal mode)
source:
  db_path: "./source.db"
  tables: ["users", "orders"]   # empty list = capture all tables

# Replication targets
targets:
  - name: "mysql_prod"
    type: "mysql"
    connection:
      type: "mysql"
      host: "localhost"
      port: 3306
      database: "cdc_backup"
      username: "${MYSQL_USER}"
      password: "${MYSQL_PASSWORD}"
    batch_size: 100
    retry_policy:
      max_retries: 3
      backoff_factor: 1.0
      max_delay: 60

  - name: "oracle_dr"
    type: "oracle"
    connection:
      type: "oracle"
      host: "oracle.example.com"
      port: 1521
      service_name: "ORCL"
      username: "${ORACLE_USER}"
      password: "${ORACLE_PASSWORD}"

# Table mappings
mappings:
  - source_table: "users"
    target_table: "users_backup"
    primary_key: "id"
    field_mappings:
      - source_field: "name"
      - source_field: "email"
        converter: "lowercase"
    filter_condition: "deleted_at IS NULL"

  - source_table: "orders"
    target_table: "orders_backup"
    primary_key: "order_id"

# Global settings
batch_size: 100
checkpoint_interval: 10
log_level: "info"
checkpoint_dir: "."
"#
}

/// Write the configuration template to a file.
pub fn save_config_template(path: &Path) -> Result<(), SyncError> {
    std::fs::write(path, config_template())
        .map_err(|e| SyncError::Config(format!("failed to write {}: {}", path.display(), e)))
}
