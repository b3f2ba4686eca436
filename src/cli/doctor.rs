//! CLI `doctor` command: verify on-disk state without modifying it.

use anyhow::Result;

use crate::config::StrataConfig;
use crate::learning::checkpoint::CheckpointStore;
use crate::learning::codec;
use crate::storage::data_file;
use crate::storage::index::TrajectoryIndex;

/// Check the weight file, every checkpoint and the trajectory index, and print a report.
///
/// Returns an error when any check failed so scripts can rely on the exit status.
pub async fn doctor(config: &StrataConfig) -> Result<()> {
    let data_dir = config.resolved_data_dir();
    if !data_dir.exists() {
        println!("Data directory: not found at {}", data_dir.display());
        println!("Nothing has been recorded yet.");
        return Ok(());
    }

    let mut problems = 0usize;

    println!("Strata Health Report");
    println!("====================");
    println!();
    println!("Data directory:    {}", data_dir.display());
    println!();

    let weights_path = config.weights_path();
    match codec::load(&weights_path).await {
        Ok(Some(file)) => {
            println!("Weight file:       OK ({} entries, saved {})", file.store.len(), file.metadata.saved_at);
        }
        Ok(None) => println!("Weight file:       (not written yet)"),
        Err(e) => {
            problems += 1;
            println!("Weight file:       FAILED ({e})");
        }
    }

    let checkpoints = CheckpointStore::verify_dir(&config.checkpoints_dir()).await?;
    let mut baselines = 0usize;
    println!("Checkpoints:       {}", checkpoints.len());
    for (path, result) in &checkpoints {
        match result {
            Ok(header) => {
                if header.is_baseline {
                    baselines += 1;
                }
            }
            Err(e) => {
                problems += 1;
                println!("  FAILED {}: {e}", path.display());
            }
        }
    }
    println!("  Baselines:       {baselines}");
    println!();

    let dir = config.trajectories_dir();
    let files = data_file::list_files(&dir).await?;
    println!("Trajectory files:  {}", files.len());
    match TrajectoryIndex::load(&dir).await {
        Ok(Some(index)) => match index.validate(&dir).await {
            Ok(()) => println!(
                "Index:             OK ({} trajectories, {})",
                index.entries.len(),
                index.format_version
            ),
            Err(e) => {
                problems += 1;
                println!("Index:             FAILED ({e})");
            }
        },
        Ok(None) if files.is_empty() => println!("Index:             (not written yet)"),
        Ok(None) => {
            problems += 1;
            println!("Index:             MISSING");
        }
        Err(e) => {
            problems += 1;
            println!("Index:             FAILED ({e})");
        }
    }

    if problems > 0 {
        println!();
        println!("Recovery steps:");
        println!("  1. `strata rebuild-index` rescans the data files and rewrites index.json");
        println!("  2. A corrupted weight file can be replaced with `strata rollback`");
        anyhow::bail!("{problems} check(s) failed");
    }

    println!();
    println!("All checks passed.");
    Ok(())
}
