// ABOUTME: Top-level sync coordinator: initial backfill then incremental streaming
// ABOUTME: Fan-out apply per target with retry, min-rule consumption, and graceful shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::broadcast;

use crate::audit::{AuditReader, ChangeEvent, Operation};
use crate::checkpoint::{CheckpointStatus, CheckpointStore, PkValue, SyncPosition};
use crate::config::{DataErrorPolicy, RetryPolicy, SyncConfig};
use crate::error::SyncError;
use crate::state::{EngineState, SyncStatus};
use crate::sync::initial::InitialSync;
use crate::targets::{RowOp, TargetWriter};
use crate::transform::Transformer;

/// Cloneable control handle for a running engine.
///
/// The engine's `start` future owns the engine; the handle lets another
/// task (a signal watcher, a status endpoint) stop it and observe it.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<SyncStatus>>,
}

impl EngineHandle {
    /// Request a graceful stop: the in-flight batch finishes (bounded by
    /// the shutdown grace period) and no new batches are fetched.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }
}

/// One target's per-batch apply outcome.
enum ApplyOutcome {
    /// All deliverable events applied; position may advance to this id
    Applied { last_id: i64, applied: u64 },
    /// Nothing to do (already past this batch)
    UpToDate,
    /// Transient failure after exhausting the retry budget; retried on
    /// the next round from the unchanged position
    Behind,
    /// Data error under the halt policy; the target is isolated
    Halted,
    /// Shutdown observed mid-retry
    Interrupted,
}

/// What one event contributes to a target batch.
#[derive(Debug, Clone)]
enum ItemState {
    Op(RowOp),
    /// Dropped by the row filter or unmapped; consumable without effect
    Skip,
    /// Transform failed; skip-policy targets pass over it, halt-policy
    /// targets stop in front of it
    Poisoned,
}

/// One event's slot in a table batch, keeping the canonical event id so
/// target-side errors can be logged against the originating audit record.
struct BatchItem {
    audit_id: i64,
    event_id: String,
    state: ItemState,
}

/// Per-table slice of one fetched batch, in audit-id order.
struct TableBatch {
    target_table: String,
    target_pk: String,
    items: Vec<BatchItem>,
}

/// The ops one target still has to apply from a table batch, paired with
/// the event ids they came from.
struct Deliverable<'a> {
    batch: &'a TableBatch,
    event_ids: Vec<&'a str>,
    ops: Vec<RowOp>,
}

/// Coordinates capture consumption, transformation, fan-out apply, and
/// durable progress for one source database.
pub struct SyncEngine {
    config: SyncConfig,
    checkpoints: CheckpointStore,
    targets: Vec<TargetWriter>,
    status: Arc<Mutex<SyncStatus>>,
    running: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let checkpoints = CheckpointStore::open(&config.checkpoint_db_path())?;
        let target_names: Vec<String> = config.targets.iter().map(|t| t.name.clone()).collect();
        let status = SyncStatus::new(&config.source.db_path, &target_names);
        let (shutdown, _) = broadcast::channel(4);

        Ok(Self {
            config,
            checkpoints,
            targets: Vec::new(),
            status: Arc::new(Mutex::new(status)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown: self.shutdown.clone(),
            running: self.running.clone(),
            status: self.status.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    fn set_state(&self, state: EngineState) {
        self.status.lock().expect("status lock poisoned").state = state;
    }

    /// Run the engine until stopped: connect and verify targets, backfill
    /// tables without a completed baseline (when `run_initial`), then
    /// stream the audit log.
    pub async fn start(&mut self, tables: Option<Vec<String>>, run_initial: bool) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("sync engine is already running");
        }

        let result = self.run(tables, run_initial).await;

        match &result {
            Ok(()) => self.set_state(EngineState::Stopped),
            Err(err) => {
                let mut status = self.status.lock().expect("status lock poisoned");
                status.state = EngineState::Failed;
                status.record_error(&err.to_string());
            }
        }
        self.disconnect_targets().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&mut self, tables: Option<Vec<String>>, run_initial: bool) -> Result<()> {
        let tables = tables.unwrap_or_else(|| {
            self.config
                .mappings
                .iter()
                .map(|m| m.source_table.clone())
                .collect()
        });

        tracing::info!(
            source = %self.config.source.db_path,
            targets = ?self.config.targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            run_initial,
            "sync engine starting"
        );

        self.connect_targets().await?;

        let mut shutdown_rx = self.shutdown.subscribe();

        if run_initial {
            self.set_state(EngineState::InitialSyncing);
            let pending = self.tables_needing_baseline(&tables)?;
            if pending.is_empty() {
                tracing::info!("all tables have a completed baseline, skipping initial sync");
            } else {
                let initial = InitialSync::new(&self.config, &self.targets, &self.checkpoints);
                tokio::select! {
                    result = initial.run(&pending) => {
                        result.context("initial sync failed")?;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("shutdown during initial sync; checkpoints preserved");
                        return Ok(());
                    }
                }
            }
        }

        self.set_state(EngineState::Incremental);
        self.run_incremental(&mut shutdown_rx).await
    }

    async fn connect_targets(&mut self) -> Result<()> {
        let mut targets = Vec::with_capacity(self.config.targets.len());
        for target_config in &self.config.targets {
            let mut writer =
                TargetWriter::from_config(target_config).map_err(anyhow::Error::from)?;
            writer
                .connect()
                .await
                .with_context(|| format!("target '{}' is unreachable", target_config.name))?;
            writer.ping().await.with_context(|| {
                format!("target '{}' failed its liveness probe", target_config.name)
            })?;
            targets.push(writer);
        }
        self.targets = targets;
        Ok(())
    }

    async fn disconnect_targets(&mut self) {
        for target in &mut self.targets {
            if let Err(err) = target.disconnect().await {
                tracing::warn!(target_name = target.name(), error = %err, "disconnect failed");
            }
        }
        self.targets.clear();
    }

    /// Tables whose initial-sync checkpoint is missing or not completed.
    fn tables_needing_baseline(&self, tables: &[String]) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for table in tables {
            let done = self
                .checkpoints
                .load_initial_checkpoint(&self.config.source.db_path, table)?
                .map(|cp| cp.status == CheckpointStatus::Completed)
                .unwrap_or(false);
            if !done {
                pending.push(table.clone());
            }
        }
        Ok(pending)
    }

    async fn run_incremental(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<()> {
        let source = self.config.source.db_path.clone();
        let checkpoints = &self.checkpoints;
        let apply_timeout = self.config.apply_timeout();

        // The handoff id is the first id the incremental stream replays;
        // a target that never streamed before starts just below it
        let handoff_floor = checkpoints
            .load_handoff_id(&source)?
            .map(|h| (h - 1).max(0))
            .unwrap_or(0);

        let mut positions: HashMap<String, SyncPosition> = HashMap::new();
        for target in &self.targets {
            let mut position = checkpoints.load_position(&source, target.name())?;
            if position.last_audit_id < handoff_floor {
                position.last_audit_id = handoff_floor;
            }
            positions.insert(target.name().to_string(), position);
        }

        let reader_floor = positions
            .values()
            .map(|p| p.last_audit_id)
            .min()
            .unwrap_or(0);

        let mut reader = AuditReader::open(
            &source,
            self.config.batch_size,
            self.config.poll_interval(),
        )?;
        reader.start(reader_floor);

        // Targets isolated by a halt-policy data error stop receiving
        // events. Their rows are never marked consumed, so the backlog
        // replays once the error is resolved, while the reader cursor
        // keeps moving for the surviving targets
        let mut halted: HashMap<String, bool> = HashMap::new();

        tracing::info!(reader_floor, "incremental sync started");

        let run_started = std::time::Instant::now();
        let mut stopping = false;
        while !stopping {
            if self.all_halted(&halted) {
                anyhow::bail!("all targets halted on non-retryable errors");
            }

            self.adapt_batch_size(&mut reader)?;

            let events = tokio::select! {
                _ = shutdown_rx.recv() => {
                    stopping = true;
                    continue;
                }
                fetched = reader.fetch_batch() => fetched?,
            };
            if events.is_empty() {
                continue;
            }

            let batches = self.group_events(&events)?;
            let batch_last_id = events.last().map(|e| e.audit_id).unwrap_or(0);

            // Fan out: each target applies the same batch independently.
            // Locals below exist so the async blocks only capture shared
            // references and copies, not the engine itself.
            let batches_ref = &batches;
            let source_ref = source.as_str();
            let applies = self.targets.iter().map(|target| {
                let name = target.name().to_string();
                let position = positions.get(&name).map(|p| p.last_audit_id).unwrap_or(0);
                let target_halted = halted.get(&name).copied().unwrap_or(false);
                let (retry_policy, data_policy) = self
                    .config
                    .target(&name)
                    .map(|t| (t.retry_policy.clone(), t.on_data_error))
                    .unwrap_or_else(|| (RetryPolicy::default(), DataErrorPolicy::Halt));
                let shutdown = self.shutdown.subscribe();
                async move {
                    if target_halted {
                        return (name, ApplyOutcome::Halted);
                    }
                    let outcome = apply_batch_to_target(
                        target,
                        batches_ref,
                        position,
                        batch_last_id,
                        &retry_policy,
                        data_policy,
                        apply_timeout,
                        shutdown,
                        checkpoints,
                        source_ref,
                    )
                    .await;
                    (name, outcome)
                }
            });

            let outcomes = join_all(applies).await;

            let mut round_failed = false;
            for (name, outcome) in outcomes {
                match outcome {
                    ApplyOutcome::Applied { last_id, applied } => {
                        let position = positions.get_mut(&name).expect("known target");
                        position.last_audit_id = last_id;
                        position.total_events += applied;
                        position.last_processed_at = chrono::Utc::now();
                        checkpoints.save_position(position)?;
                        self.update_target_status(&name, last_id, true, None);
                    }
                    ApplyOutcome::UpToDate => {
                        self.update_target_status(&name, positions[&name].last_audit_id, true, None);
                    }
                    ApplyOutcome::Behind => {
                        round_failed = true;
                        tracing::warn!(target_name = %name, "target fell behind; retrying next round");
                        self.update_target_status(
                            &name,
                            positions[&name].last_audit_id,
                            true,
                            Some("retry budget exhausted; lagging".to_string()),
                        );
                    }
                    ApplyOutcome::Halted => {
                        round_failed = true;
                        halted.insert(name.clone(), true);
                        self.update_target_status(
                            &name,
                            positions[&name].last_audit_id,
                            false,
                            Some("halted on data error".to_string()),
                        );
                    }
                    ApplyOutcome::Interrupted => {
                        round_failed = true;
                        stopping = true;
                    }
                }
            }

            // Min rule, in two floors. Rows are stamped consumed only up
            // to what every target, halted included, has durably applied,
            // so a halted target's backlog stays replayable after its
            // data error is resolved. The reader cursor, however, follows
            // the surviving targets: a target that will never advance
            // again must not pin delivery for the others.
            let durable_floor = self
                .targets
                .iter()
                .map(|t| positions[t.name()].last_audit_id)
                .min()
                .unwrap_or(0);
            let active_floor = self
                .targets
                .iter()
                .filter(|t| !halted.get(t.name()).copied().unwrap_or(false))
                .map(|t| positions[t.name()].last_audit_id)
                .min();

            let consumable: Vec<i64> = events
                .iter()
                .map(|e| e.audit_id)
                .filter(|id| *id <= durable_floor)
                .collect();
            if !consumable.is_empty() {
                reader.mark_consumed(&consumable)?;
            }

            let active_floor = match active_floor {
                Some(floor) => floor,
                // Every target is halted; the check at the loop top turns
                // this into the engine-level failure
                None => continue,
            };
            reader.advance_cursor(active_floor);

            if round_failed && active_floor < batch_last_id {
                let pending: Vec<i64> = events
                    .iter()
                    .map(|e| e.audit_id)
                    .filter(|id| *id > durable_floor)
                    .collect();
                reader.increment_retry(&pending)?;
            }

            self.record_batch_progress(&events, active_floor, &reader, &positions, run_started)?;
        }

        // Drain: positions are already durable per batch; flush the
        // remaining bookkeeping inside the grace window
        self.set_state(EngineState::Stopping);
        reader.stop();
        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            for position in positions.values() {
                if let Err(err) = checkpoints.save_position(position) {
                    tracing::warn!(error = %err, "failed to persist position during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(?grace, "shutdown grace period elapsed before drain finished");
        }

        tracing::info!("incremental sync stopped");
        Ok(())
    }

    /// Fold one round's results into the status snapshot. `applied_floor`
    /// is the highest id every non-halted target has applied; events at
    /// or below it count as processed.
    fn record_batch_progress(
        &self,
        events: &[ChangeEvent],
        applied_floor: i64,
        reader: &AuditReader,
        positions: &HashMap<String, SyncPosition>,
        run_started: std::time::Instant,
    ) -> Result<()> {
        let stats = reader.stats()?;
        let mut status = self.status.lock().expect("status lock poisoned");
        for event in events {
            if event.audit_id <= applied_floor {
                status.total_events += 1;
                status.record_event(&event.table_name, event.operation);
            }
        }
        let elapsed = run_started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            status.events_per_second = status.total_events as f64 / elapsed;
        }
        status.backlog = stats.backlog;
        for target in status.targets.iter_mut() {
            if let Some(position) = positions.get(&target.name) {
                target.lag_events = (stats.max_id - position.last_audit_id).max(0) as u64;
            }
        }
        Ok(())
    }

    fn all_halted(&self, halted: &HashMap<String, bool>) -> bool {
        !self.targets.is_empty()
            && self
                .targets
                .iter()
                .all(|t| halted.get(t.name()).copied().unwrap_or(false))
    }

    /// Widen the fetch size while the backlog is above the threshold.
    fn adapt_batch_size(&self, reader: &mut AuditReader) -> Result<()> {
        let stats = reader.stats()?;
        if stats.backlog > self.config.backlog_threshold {
            let widened = (reader.batch_size() * 2).min(self.config.max_batch_size);
            if widened > reader.batch_size() {
                tracing::debug!(
                    backlog = stats.backlog,
                    batch_size = widened,
                    "widening batch size under backlog"
                );
                reader.set_batch_size(widened);
            }
        } else if reader.batch_size() != self.config.batch_size {
            reader.set_batch_size(self.config.batch_size);
        }
        Ok(())
    }

    /// Group a fetched batch by table, transforming rows and building ops.
    ///
    /// Events for tables without a mapping are logged and carried as
    /// skips so their ids still get consumed. Transform failures become
    /// poisoned items: skip-policy targets pass over them, halt-policy
    /// targets stop in front of them.
    fn group_events(&self, events: &[ChangeEvent]) -> Result<Vec<TableBatch>> {
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<&ChangeEvent>> = HashMap::new();
        for event in events {
            if !grouped.contains_key(&event.table_name) {
                order.push(event.table_name.clone());
            }
            grouped
                .entry(event.table_name.clone())
                .or_default()
                .push(event);
        }

        let mut batches = Vec::new();
        for table in order {
            let table_events = grouped.remove(&table).expect("grouped above");
            let mapping = match self.config.table_mapping(&table) {
                Some(mapping) => mapping,
                None => {
                    tracing::warn!(table = %table, "no mapping for captured table; events dropped");
                    batches.push(TableBatch {
                        target_table: table.clone(),
                        target_pk: String::new(),
                        items: table_events
                            .into_iter()
                            .map(|e| BatchItem {
                                audit_id: e.audit_id,
                                event_id: e.event_id.clone(),
                                state: ItemState::Skip,
                            })
                            .collect(),
                    });
                    continue;
                }
            };
            let transformer = Transformer::new(mapping).map_err(anyhow::Error::from)?;

            let mut items = Vec::with_capacity(table_events.len());
            for event in table_events {
                let state = match build_op(event, &transformer) {
                    Ok(Some(op)) => ItemState::Op(op),
                    Ok(None) => ItemState::Skip,
                    Err(message) => {
                        for target in &self.targets {
                            self.checkpoints.log_error(
                                &self.config.source.db_path,
                                target.name(),
                                Some(&event.event_id),
                                "data",
                                &message,
                            )?;
                        }
                        tracing::error!(
                            event_id = %event.event_id,
                            error = %message,
                            "transform failed"
                        );
                        ItemState::Poisoned
                    }
                };
                items.push(BatchItem {
                    audit_id: event.audit_id,
                    event_id: event.event_id.clone(),
                    state,
                });
            }

            batches.push(TableBatch {
                target_table: transformer.target_table().to_string(),
                target_pk: transformer.target_primary_key().to_string(),
                items,
            });
        }
        Ok(batches)
    }

    fn update_target_status(
        &self,
        name: &str,
        last_audit_id: i64,
        healthy: bool,
        error: Option<String>,
    ) {
        let mut status = self.status.lock().expect("status lock poisoned");
        if let Some(target) = status.target_mut(name) {
            target.last_audit_id = last_audit_id;
            target.healthy = healthy;
            if let Some(ref message) = error {
                target.retry_count += 1;
                target.last_error = Some(message.clone());
            }
        }
        if !healthy {
            if let Some(message) = error {
                status.record_error(&message);
            }
        }
    }
}

/// Convert one change event into a target op, if it survives the filter.
fn build_op(
    event: &ChangeEvent,
    transformer: &Transformer<'_>,
) -> Result<Option<RowOp>, String> {
    match event.operation {
        Operation::Insert | Operation::Update => {
            let after = event
                .after_data
                .as_ref()
                .ok_or_else(|| "missing after-image".to_string())?;
            match transformer.transform(after).map_err(|e| e.to_string())? {
                Some(row) => Ok(Some(RowOp::Upsert(row))),
                None => Ok(None),
            }
        }
        Operation::Delete => Ok(Some(RowOp::Delete(PkValue::parse(&event.row_id)))),
    }
}

/// Exponential backoff with jitter: `backoff_factor * 2^attempt`, capped
/// at `max_delay`, plus up to one second of jitter.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff_factor * f64::powi(2.0, attempt as i32);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64((base + jitter).min(policy.max_delay as f64))
}

/// Apply every deliverable event of a batch to one target, retrying
/// transient failures with exponential backoff.
#[allow(clippy::too_many_arguments)]
async fn apply_batch_to_target(
    target: &TargetWriter,
    batches: &[TableBatch],
    position: i64,
    batch_last_id: i64,
    retry_policy: &RetryPolicy,
    data_policy: DataErrorPolicy,
    apply_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
    checkpoints: &CheckpointStore,
    source: &str,
) -> ApplyOutcome {
    if batch_last_id <= position {
        return ApplyOutcome::UpToDate;
    }

    // A poisoned event in range stops a halt-policy target before any of
    // this batch lands; its position stays put and its rows stay
    // unconsumed for a later replay
    let has_poison = batches.iter().any(|batch| {
        batch
            .items
            .iter()
            .any(|item| item.audit_id > position && matches!(item.state, ItemState::Poisoned))
    });
    if has_poison && data_policy == DataErrorPolicy::Halt {
        return ApplyOutcome::Halted;
    }

    // Per-target filter: events at or below this target's own checkpoint
    // were applied in a previous round (re-delivery covers laggards)
    let deliverable: Vec<Deliverable<'_>> = batches
        .iter()
        .map(|batch| {
            let mut event_ids = Vec::new();
            let mut ops = Vec::new();
            for item in &batch.items {
                if item.audit_id <= position {
                    continue;
                }
                if let ItemState::Op(op) = &item.state {
                    event_ids.push(item.event_id.as_str());
                    ops.push(op.clone());
                }
            }
            Deliverable {
                batch,
                event_ids,
                ops,
            }
        })
        .collect();

    let total_ops: usize = deliverable.iter().map(|d| d.ops.len()).sum();
    if total_ops == 0 {
        // Everything in range was filtered or unmapped; just advance
        return ApplyOutcome::Applied {
            last_id: batch_last_id,
            applied: 0,
        };
    }

    let mut attempt: u32 = 0;
    loop {
        match try_apply_once(
            target,
            &deliverable,
            data_policy,
            apply_timeout,
            checkpoints,
            source,
        )
        .await
        {
            Ok(applied) => {
                return ApplyOutcome::Applied {
                    last_id: batch_last_id,
                    applied,
                }
            }
            Err(err) if err.is_retryable() && attempt < retry_policy.max_retries => {
                attempt += 1;
                let delay = backoff_delay(retry_policy, attempt - 1);
                tracing::warn!(
                    target_name = target.name(),
                    attempt,
                    ?delay,
                    error = %err,
                    "apply failed; backing off"
                );
                let _ = checkpoints.log_error(source, target.name(), None, err.kind(), &err.to_string());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => return ApplyOutcome::Interrupted,
                }
            }
            Err(err) if err.is_retryable() => {
                tracing::error!(
                    target_name = target.name(),
                    error = %err,
                    "retry budget exhausted"
                );
                return ApplyOutcome::Behind;
            }
            Err(err) => {
                // The writer only knows the target-side row it choked on;
                // map that back to the canonical event id before logging
                let event_id = canonical_event_id(&deliverable, &err);
                let _ = checkpoints.log_error(
                    source,
                    target.name(),
                    event_id,
                    err.kind(),
                    &err.to_string(),
                );
                if data_policy == DataErrorPolicy::Skip {
                    // Skipping already happened per-op; anything left is
                    // unexpected but must not wedge the target forever
                    tracing::error!(
                        target_name = target.name(),
                        error = %err,
                        "non-retryable error under skip policy"
                    );
                    return ApplyOutcome::Behind;
                }
                tracing::error!(
                    target_name = target.name(),
                    error = %err,
                    "non-retryable error; target halted"
                );
                return ApplyOutcome::Halted;
            }
        }
    }
}

/// One apply attempt across all table groups, honoring the data-error
/// policy: under `skip`, a failing batch degrades to per-op application
/// and bad ops are logged and passed over.
async fn try_apply_once(
    target: &TargetWriter,
    deliverable: &[Deliverable<'_>],
    data_policy: DataErrorPolicy,
    apply_timeout: Duration,
    checkpoints: &CheckpointStore,
    source: &str,
) -> Result<u64, SyncError> {
    let mut applied = 0u64;
    for group in deliverable {
        if group.ops.is_empty() {
            continue;
        }
        let attempt = tokio::time::timeout(
            apply_timeout,
            target.apply_batch(&group.batch.target_table, &group.batch.target_pk, &group.ops),
        )
        .await;

        match attempt {
            Ok(Ok(count)) => {
                applied += count;
                let upserts = group
                    .ops
                    .iter()
                    .filter(|op| matches!(op, RowOp::Upsert(_)))
                    .count();
                let deletes = group.ops.len() - upserts;
                if upserts > 0 {
                    let _ = checkpoints.update_stats(
                        source,
                        target.name(),
                        &group.batch.target_table,
                        "UPSERT",
                        upserts as u64,
                    );
                }
                if deletes > 0 {
                    let _ = checkpoints.update_stats(
                        source,
                        target.name(),
                        &group.batch.target_table,
                        "DELETE",
                        deletes as u64,
                    );
                }
            }
            Ok(Err(SyncError::Data { event_id, .. })) if data_policy == DataErrorPolicy::Skip => {
                // The per-op pass logs each bad op under its own event id
                tracing::warn!(
                    target_name = target.name(),
                    writer_hint = %event_id,
                    "data error under skip policy; applying per-op"
                );
                applied += apply_per_op(target, group, apply_timeout, checkpoints, source).await?;
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                return Err(SyncError::Transient {
                    target: target.name().to_string(),
                    message: format!("apply timed out after {:?}", apply_timeout),
                })
            }
        }
    }
    Ok(applied)
}

/// Per-op fallback for the skip policy: each op applies individually,
/// data errors are logged against their originating event id and
/// skipped, transient errors still propagate to the retry loop.
async fn apply_per_op(
    target: &TargetWriter,
    group: &Deliverable<'_>,
    apply_timeout: Duration,
    checkpoints: &CheckpointStore,
    source: &str,
) -> Result<u64, SyncError> {
    let mut applied = 0u64;
    for (event_id, op) in group.event_ids.iter().zip(&group.ops) {
        let single = std::slice::from_ref(op);
        let attempt = tokio::time::timeout(
            apply_timeout,
            target.apply_batch(&group.batch.target_table, &group.batch.target_pk, single),
        )
        .await;
        match attempt {
            Ok(Ok(count)) => applied += count,
            Ok(Err(SyncError::Data { message, .. })) => {
                let _ = checkpoints.log_error(source, target.name(), Some(event_id), "data", &message);
                tracing::warn!(event_id = %event_id, "skipped op after data error");
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) => {
                return Err(SyncError::Transient {
                    target: target.name().to_string(),
                    message: format!("apply timed out after {:?}", apply_timeout),
                })
            }
        }
    }
    Ok(applied)
}

/// Resolve a writer-reported data error back to the canonical event id.
///
/// Writers identify the failing row as `"{target_table}:{pk_value}"`;
/// the deliverable still pairs every op with the event it came from, so
/// the pk value leads back to the `"{id}:{table}:{row_id}"` form the
/// error log keys on.
fn canonical_event_id<'a>(deliverable: &'a [Deliverable<'_>], err: &SyncError) -> Option<&'a str> {
    let SyncError::Data { event_id: hint, .. } = err else {
        return None;
    };
    let (table, key) = hint.split_once(':')?;
    let group = deliverable
        .iter()
        .find(|d| d.batch.target_table == table)?;
    group
        .event_ids
        .iter()
        .zip(&group.ops)
        .find(|(_, op)| op_pk_display(op, &group.batch.target_pk).as_deref() == Some(key))
        .map(|(event_id, _)| *event_id)
}

/// The primary-key value of an op, rendered the way writers render it in
/// their error hints.
fn op_pk_display(op: &RowOp, primary_key: &str) -> Option<String> {
    match op {
        RowOp::Upsert(row) => row.get(primary_key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        RowOp::Delete(key) => Some(key.to_string()),
    }
}
