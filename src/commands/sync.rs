// ABOUTME: Sync command: initial-only, incremental-only, or full lifecycle
// ABOUTME: Wires the engine to Ctrl-C for graceful shutdown

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::path::Path;

use crate::checkpoint::CheckpointStore;
use crate::config::{load_config, SyncConfig};
use crate::sync::{InitialSync, SyncEngine};
use crate::targets::TargetWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    /// Baseline copy then continuous streaming
    Full,
    /// Baseline copy only
    Initial,
    /// Continuous streaming only
    Incremental,
}

pub async fn sync(config_path: &Path, mode: SyncMode, tables: Option<Vec<String>>) -> Result<()> {
    let config = load_config(config_path)?;

    match mode {
        SyncMode::Initial => run_initial_only(config, tables).await,
        SyncMode::Full => run_engine(config, tables, true).await,
        SyncMode::Incremental => run_engine(config, tables, false).await,
    }
}

async fn run_engine(config: SyncConfig, tables: Option<Vec<String>>, run_initial: bool) -> Result<()> {
    let mut engine = SyncEngine::new(config)?;
    let handle = engine.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping sync engine");
            handle.stop();
        }
    });

    println!("Sync running; press Ctrl-C to stop");
    engine.start(tables, run_initial).await
}

async fn run_initial_only(config: SyncConfig, tables: Option<Vec<String>>) -> Result<()> {
    let checkpoints = CheckpointStore::open(&config.checkpoint_db_path())?;

    let mut targets = Vec::with_capacity(config.targets.len());
    for target_config in &config.targets {
        let mut writer = TargetWriter::from_config(target_config)?;
        writer
            .connect()
            .await
            .with_context(|| format!("target '{}' is unreachable", target_config.name))?;
        targets.push(writer);
    }

    let tables = tables.unwrap_or_else(|| {
        config
            .mappings
            .iter()
            .map(|m| m.source_table.clone())
            .collect()
    });

    let initial = InitialSync::new(&config, &targets, &checkpoints);
    let handoff_id = initial.run(&tables).await?;

    for target in &mut targets {
        target.disconnect().await?;
    }

    println!("Initial sync complete (handoff id {})", handoff_id);
    Ok(())
}
