//! CLI maintenance commands: `prune`, `compact` and `rebuild-index`.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::StrataConfig;
use crate::storage::TrajectoryFilter;

pub struct PruneArgs {
    pub older_than_days: Option<u32>,
    pub route: Option<String>,
    pub max_quality: Option<f64>,
    pub limit: Option<usize>,
}

/// Delete trajectories matching the filter. Baseline-backing trajectories are skipped.
pub async fn prune(config: &StrataConfig, args: PruneArgs) -> Result<()> {
    let filter = TrajectoryFilter {
        route: args.route,
        older_than: args
            .older_than_days
            .map(|days| Utc::now() - Duration::days(i64::from(days))),
        max_quality: args.max_quality,
        processed_only: false,
    };

    let engine = super::open_engine(config).await?;
    let report = engine.prune_trajectories(&filter, args.limit).await?;

    println!("Matched:             {}", report.matched);
    println!("Removed:             {}", report.removed);
    if report.skipped_protected > 0 {
        println!("Skipped (baseline):  {}", report.skipped_protected);
    }
    if report.truncated {
        println!("More trajectories match; run prune again to continue.");
    }

    super::close_engine(engine).await
}

/// Rewrite data files to drop superseded and deleted records.
pub async fn compact(config: &StrataConfig) -> Result<()> {
    let engine = super::open_engine(config).await?;
    println!("Compacting trajectory files...");
    let report = engine.stream().compact().await?;

    if report.files_rewritten + report.files_removed == 0 {
        println!("  Nothing to compact.");
    } else {
        println!(
            "  Rewrote {} files, removed {} empty files, reclaimed {}.",
            report.files_rewritten,
            report.files_removed,
            super::format_bytes(report.bytes_reclaimed)
        );
    }

    super::close_engine(engine).await
}

/// Rescan every data file and rewrite the index.
pub async fn rebuild_index(config: &StrataConfig) -> Result<()> {
    let engine = super::open_engine(config).await?;
    let count = engine.stream().rebuild_index().await?;
    println!("Index rebuilt: {count} trajectories.");
    super::close_engine(engine).await
}
