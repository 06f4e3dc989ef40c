// ABOUTME: Validate command: parse the configuration and probe every target
// ABOUTME: Exits nonzero on configuration or reachability failures

use anyhow::Result;
use std::path::Path;

use crate::config::load_config;
use crate::targets::TargetWriter;

/// Parse the configuration, open the source database, and verify every
/// target is reachable. Errors keep their `SyncError` classification so
/// the CLI can map them to exit codes.
pub async fn validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration OK: {}", config_path.display());
    println!("  source:   {}", config.source.db_path);
    println!("  targets:  {}", config.targets.len());
    println!("  mappings: {}", config.mappings.len());

    // The source may not exist yet on a fresh deployment; only verify it
    // opens when it is already there
    if Path::new(&config.source.db_path).exists() {
        let conn = crate::sqlite::open_source(&config.source.db_path)?;
        drop(conn);
        println!("  source database opens in WAL mode");
    } else {
        println!("  source database not created yet (will be on first write)");
    }

    for target_config in &config.targets {
        let mut writer = TargetWriter::from_config(target_config)?;
        writer.connect().await?;
        writer.ping().await?;
        writer.disconnect().await?;
        println!("  target '{}' reachable", target_config.name);
    }

    println!("Validation passed");
    Ok(())
}
