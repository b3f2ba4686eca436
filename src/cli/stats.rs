use anyhow::Result;

use crate::config::StrataConfig;

/// Display engine statistics in the terminal.
pub async fn stats(config: &StrataConfig) -> Result<()> {
    let engine = super::open_engine(config).await?;
    let stats = engine.get_stats().await;
    let stream = engine.stream().stats().await;

    println!("Learning Statistics");
    println!("{}", "=".repeat(40));
    println!("  Routes:              {}", stats.routes);
    println!("  Weights:             {}", stats.weights);
    println!("  Mean Fisher:         {:.4}", stats.mean_fisher);
    println!("  Patterns:            {}", stats.patterns);
    println!();

    println!("Safety:");
    println!("  State:               {}", stats.safety_state);
    println!("  Checkpoints:         {}", stats.checkpoints);
    println!("  Baselines:           {}", stats.baselines);
    println!("  Rollbacks:           {}", stats.rollback_count);
    if let Some(ref drift) = stats.last_drift {
        println!(
            "  Last drift:          {:.4} ({}, vs {})",
            drift.drift,
            drift.status.as_str(),
            drift.baseline_id
        );
    }
    println!();

    println!("Trajectories:");
    println!("  Hot window:          {} ({} unsaved)", stream.hot, stream.hot_dirty);
    println!("  Pending:             {}", stream.pending);
    println!("  On disk:             {}", stream.on_disk);
    println!("  Data files:          {}", stream.files);
    println!("  Data size:           {}", super::format_bytes(stream.bytes));
    println!("  Tombstones:          {}", stream.tombstones);
    println!("  Write format:        {}", stream.format_version);

    super::close_engine(engine).await
}
