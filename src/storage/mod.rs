//! Trajectory storage: a bounded hot window in front of append-only data files and a
//! JSON index.

pub mod data_file;
pub mod guard;
pub mod index;
pub mod memory;
pub mod migrate;
pub mod record;
pub mod stream;
pub mod window;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::learning::types::Trajectory;

pub use guard::{BaselineGuard, BaselineRegistry, NoBaselineGuard};
pub use memory::{MemoryGuard, MemoryProbe, MemoryUsage, ProcMemoryProbe};
pub use migrate::{MigrationOptions, MigrationProgress, MigrationReport};
pub use record::FormatVersion;
pub use stream::{StreamDeps, TrajectoryStreamManager};

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers never see
/// a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await
}

/// Predicate over trajectories. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryFilter {
    pub route: Option<String>,
    /// Only trajectories created strictly before this instant.
    pub older_than: Option<DateTime<Utc>>,
    /// Only scored trajectories with `quality <= max_quality`.
    pub max_quality: Option<f64>,
    pub processed_only: bool,
}

impl TrajectoryFilter {
    pub fn matches(&self, trajectory: &Trajectory) -> bool {
        if let Some(route) = &self.route {
            if &trajectory.route != route {
                return false;
            }
        }
        if let Some(cutoff) = self.older_than {
            if trajectory.created_at >= cutoff {
                return false;
            }
        }
        if let Some(max) = self.max_quality {
            match trajectory.quality {
                Some(q) if q <= max => {}
                _ => return false,
            }
        }
        !(self.processed_only && !trajectory.processed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub files_touched: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
    /// A baseline-backing trajectory was removed because `force` was set.
    pub forced_baseline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Trajectories matching the filter.
    pub matched: usize,
    pub removed: usize,
    pub skipped_protected: usize,
    /// More matched than the per-call cap allowed.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub files_rewritten: usize,
    pub files_removed: usize,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub hot: usize,
    pub hot_dirty: usize,
    pub pending: usize,
    pub on_disk: usize,
    pub files: usize,
    pub bytes: u64,
    pub tombstones: u64,
    pub format_version: FormatVersion,
}
