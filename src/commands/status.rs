// ABOUTME: Status command: baseline progress, per-target positions, lag, and errors
// ABOUTME: Reads the checkpoint store and the audit table without touching targets

use anyhow::Result;
use std::path::Path;

use crate::checkpoint::CheckpointStore;
use crate::config::load_config;

pub async fn status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let source = &config.source.db_path;
    let store = CheckpointStore::open(&config.checkpoint_db_path())?;

    println!("Sync status for {}", source);
    println!("{}", "=".repeat(48));

    let checkpoints = store.list_initial_checkpoints(source)?;
    if !checkpoints.is_empty() {
        println!("\nInitial sync:");
        for checkpoint in &checkpoints {
            println!(
                "  {:<24} {:>10} rows  [{}]",
                checkpoint.table_name,
                checkpoint.total_synced,
                checkpoint.status.as_str()
            );
        }
    }

    // Backlog comes straight from the audit table when the source exists
    let max_audit_id = if Path::new(source).exists() {
        let conn = crate::sqlite::open_source(source)?;
        crate::audit::max_audit_id(&conn)?
    } else {
        0
    };

    println!("\nIncremental sync:");
    for target in &config.targets {
        let position = store.load_position(source, &target.name)?;
        let lag = (max_audit_id - position.last_audit_id).max(0);
        println!("  target '{}'", target.name);
        println!("    last audit id: {}", position.last_audit_id);
        println!("    events total:  {}", position.total_events);
        println!("    lag:           {} events", lag);

        let errors = store.list_unresolved_errors(source, Some(&target.name))?;
        if let Some(last) = errors.last() {
            println!(
                "    last error:    [{}] {} (retries: {})",
                last.error_kind, last.error_message, last.retry_count
            );
            println!("    unresolved:    {}", errors.len());
        }
    }

    if let Some(handoff) = store.load_handoff_id(source)? {
        println!("\nHandoff id: {}", handoff);
    }

    Ok(())
}
