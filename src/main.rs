// ABOUTME: CLI entry point for cdc-replicator
// ABOUTME: Parses subcommands, initializes logging, maps errors to exit codes

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cdc_replicator::commands::{self, SyncMode};
use cdc_replicator::error::SyncError;

#[derive(Parser)]
#[command(name = "cdc-replicator")]
#[command(about = "Replicate SQLite changes to MySQL and Oracle targets", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the sync configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "CDC_REPLICATOR_CONFIG",
        default_value = "sync.yaml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "CDC_REPLICATOR_LOG", default_value = "info")]
    log: String,
    /// Append logs to a file instead of stderr
    #[arg(long, global = true, env = "CDC_REPLICATOR_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration template
    Init {
        /// Output path for the template
        #[arg(default_value = "sync.yaml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration and target reachability
    Validate,
    /// Run data synchronization
    Sync {
        /// full = baseline + streaming, initial = baseline only,
        /// incremental = streaming only
        #[arg(long, value_enum, default_value_t = SyncMode::Full)]
        mode: SyncMode,
        /// Restrict to these source tables (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },
    /// Show baseline and streaming progress
    Status,
    /// Clear initial-sync checkpoints
    Reset {
        /// Reset only this table (all mapped tables otherwise)
        #[arg(long)]
        table: Option<String>,
    },
}

/// Exit codes: 0 success, 2 configuration error, 3 reachability failure,
/// 4 runtime failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Config(_)) => 2,
        Some(SyncError::Reachability { .. }) => 3,
        _ => 4,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG has highest precedence, then --log / CDC_REPLICATOR_LOG
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // The non-blocking writer guard must outlive the run
    let _log_guard = match &cli.log_file {
        Some(path) => {
            let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("failed to open log file {}: {}", path.display(), err);
                    std::process::exit(4);
                }
            };
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    };

    if let Err(err) = run(cli).await {
        tracing::error!("{:#}", err);
        eprintln!("error: {:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            cdc_replicator::config::save_config_template(&path)
                .context("failed to write configuration template")?;
            println!("Configuration template written to {}", path.display());
            Ok(())
        }
        Commands::Validate => commands::validate(&cli.config).await,
        Commands::Sync { mode, tables } => commands::sync(&cli.config, mode, tables).await,
        Commands::Status => commands::status(&cli.config).await,
        Commands::Reset { table } => commands::reset(&cli.config, table).await,
    }
}
