// ABOUTME: Reset command: clear initial-sync checkpoints for one table or all
// ABOUTME: The next sync run re-copies the affected tables from scratch

use anyhow::Result;
use std::path::Path;

use crate::checkpoint::CheckpointStore;
use crate::config::load_config;

pub async fn reset(config_path: &Path, table: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let source = &config.source.db_path;
    let store = CheckpointStore::open(&config.checkpoint_db_path())?;

    match table {
        Some(table) => {
            store.delete_initial_checkpoint(source, &table)?;
            println!("Checkpoint reset for table '{}'", table);
        }
        None => {
            for mapping in &config.mappings {
                store.delete_initial_checkpoint(source, &mapping.source_table)?;
            }
            println!("Checkpoints reset for all {} mapped tables", config.mappings.len());
        }
    }
    Ok(())
}
