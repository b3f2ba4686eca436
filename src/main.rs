use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use strata::cli;
use strata::config::StrataConfig;

#[derive(Parser)]
#[command(name = "strata", version, about = "Embedded learning engine: pattern weights, checkpoints and trajectory storage")]
struct Cli {
    /// Config file (defaults to ~/.strata/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show weight, safety and trajectory statistics
    Stats,
    /// Verify the weight file, checkpoints and trajectory index
    Doctor,
    /// List checkpoints
    Checkpoints,
    /// Snapshot the current weights
    Checkpoint {
        reason: String,
        /// Mark the new checkpoint as a drift baseline
        #[arg(long)]
        baseline: bool,
    },
    /// Restore a checkpoint (the most recent one by default)
    Rollback { id: Option<String> },
    /// Re-encode trajectory files into another format version
    Migrate {
        #[arg(long)]
        to: u8,
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        #[arg(long)]
        no_backup: bool,
        #[arg(long)]
        keep_backup: bool,
        /// Migrate at most this many files in this run
        #[arg(long)]
        max_files: Option<usize>,
    },
    /// Rescan data files and rewrite the trajectory index
    RebuildIndex,
    /// Delete trajectories matching a filter
    Prune {
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long)]
        route: Option<String>,
        #[arg(long)]
        max_quality: Option<f64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rewrite data files without superseded or deleted records
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StrataConfig::load_from(path)?,
        None => StrataConfig::load()?,
    };

    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Stats => cli::stats::stats(&config).await?,
        Command::Doctor => cli::doctor::doctor(&config).await?,
        Command::Checkpoints => cli::checkpoints::list(&config).await?,
        Command::Checkpoint { reason, baseline } => {
            cli::checkpoints::create(&config, &reason, baseline).await?
        }
        Command::Rollback { id } => cli::checkpoints::rollback(&config, id.as_deref()).await?,
        Command::Migrate {
            to,
            backup_dir,
            no_backup,
            keep_backup,
            max_files,
        } => {
            cli::migrate::migrate(
                &config,
                cli::migrate::MigrateArgs {
                    to,
                    backup_dir,
                    no_backup,
                    keep_backup,
                    max_files,
                },
            )
            .await?
        }
        Command::RebuildIndex => cli::maintenance::rebuild_index(&config).await?,
        Command::Prune {
            older_than_days,
            route,
            max_quality,
            limit,
        } => {
            cli::maintenance::prune(
                &config,
                cli::maintenance::PruneArgs {
                    older_than_days,
                    route,
                    max_quality,
                    limit,
                },
            )
            .await?
        }
        Command::Compact => cli::maintenance::compact(&config).await?,
    }

    Ok(())
}
