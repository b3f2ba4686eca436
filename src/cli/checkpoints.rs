//! CLI checkpoint commands: `checkpoints`, `checkpoint` and `rollback`.

use anyhow::Result;

use crate::config::StrataConfig;

/// List checkpoints, oldest first.
pub async fn list(config: &StrataConfig) -> Result<()> {
    let engine = super::open_engine(config).await?;
    let checkpoints = engine.list_checkpoints().await;

    if checkpoints.is_empty() {
        println!("No checkpoints.");
    } else {
        println!("{:<32} {:<25} {:>8} {:>6}  {}", "ID", "CREATED", "ENTRIES", "TRAJ", "REASON");
        for c in &checkpoints {
            let marker = if c.is_baseline { " [baseline]" } else { "" };
            println!(
                "{:<32} {:<25} {:>8} {:>6}  {}{marker}",
                c.id,
                c.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                c.entries,
                c.trajectories,
                c.reason,
            );
        }
    }

    super::close_engine(engine).await
}

/// Snapshot the current weights.
pub async fn create(config: &StrataConfig, reason: &str, baseline: bool) -> Result<()> {
    let engine = super::open_engine(config).await?;
    let id = engine.create_checkpoint(reason, baseline).await?;
    println!("Created checkpoint {id}{}", if baseline { " (baseline)" } else { "" });
    super::close_engine(engine).await
}

/// Restore a checkpoint, or the most recent one when `id` is `None`.
pub async fn rollback(config: &StrataConfig, id: Option<&str>) -> Result<()> {
    let engine = super::open_engine(config).await?;
    let outcome = engine.rollback_to_checkpoint(id).await?;
    println!(
        "Rolled back to {} ({} weights restored, rollback #{})",
        outcome.checkpoint_id, outcome.restored_entries, outcome.rollback_count
    );
    super::close_engine(engine).await
}
