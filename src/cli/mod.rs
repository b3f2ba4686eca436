pub mod checkpoints;
pub mod doctor;
pub mod maintenance;
pub mod migrate;
pub mod stats;

use anyhow::{Context, Result};

use crate::config::StrataConfig;
use crate::learning::{EngineDeps, LearningEngine};

/// Open the engine for a one-shot CLI command.
pub async fn open_engine(config: &StrataConfig) -> Result<LearningEngine> {
    LearningEngine::open(config.clone(), EngineDeps::default())
        .await
        .with_context(|| {
            format!(
                "failed to open learning engine at {}",
                config.resolved_data_dir().display()
            )
        })
}

/// Flush and save before the process exits.
pub async fn close_engine(engine: LearningEngine) -> Result<()> {
    engine.close().await.context("failed to close learning engine")
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
