//! On-disk format migration.
//!
//! Migration is file-by-file: each old-format file is rewritten into a new file in the
//! target format and the index is saved before the old file is removed, so the store is
//! consistent after every step. A backup of the directory is taken first and restored if
//! any step fails.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::data_file;
use super::index::TrajectoryIndex;
use super::record::FormatVersion;
use super::stream::{IoState, TrajectoryStreamManager};
use crate::error::{StorageError, StorageResult};
use crate::telemetry::OpTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub files_done: usize,
    pub files_total: usize,
    pub records_done: usize,
}

pub type ProgressFn = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MigrationOptions {
    /// Where to put the backup. Defaults to a timestamped sibling of the store directory.
    pub backup_dir: Option<PathBuf>,
    pub skip_backup: bool,
    /// Keep the backup after a successful migration.
    pub keep_backup: bool,
    /// Stop after this many files; the report says whether the store is fully migrated.
    pub max_files: Option<usize>,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Versions found in data file headers before migrating.
    pub from: Vec<FormatVersion>,
    pub to: FormatVersion,
    pub files_migrated: usize,
    pub records_migrated: usize,
    pub files_remaining: usize,
    pub backup_path: Option<PathBuf>,
    pub completed: bool,
}

impl TrajectoryStreamManager {
    /// Format versions present in the data file headers.
    pub async fn detect_versions(&self) -> StorageResult<BTreeSet<FormatVersion>> {
        let mut versions = BTreeSet::new();
        for file_id in data_file::list_files(&self.dir).await? {
            versions.insert(data_file::read_header(&self.dir, file_id).await?.version);
        }
        Ok(versions)
    }

    /// Re-encode every data file into `target`. New writes use `target` from here on.
    pub async fn migrate_to_version(
        &self,
        target: FormatVersion,
        options: MigrationOptions,
    ) -> StorageResult<MigrationReport> {
        let timer = OpTimer::start("stream", "migrate");
        let result = self.run_migration(target, options).await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    async fn run_migration(
        &self,
        target: FormatVersion,
        options: MigrationOptions,
    ) -> StorageResult<MigrationReport> {
        self.flush().await.map_err(|e| StorageError::MigrationFailed {
            target: target.as_u8(),
            reason: format!("flushing pending trajectories failed: {e}"),
        })?;

        let mut io = self.io.write().await;
        let mut from = BTreeSet::new();
        let mut to_migrate = Vec::new();
        for &file_id in io.index.files.keys() {
            let version = data_file::read_header(&self.dir, file_id).await?.version;
            from.insert(version);
            if version != target {
                to_migrate.push(file_id);
            }
        }

        let mut report = MigrationReport {
            from: from.into_iter().collect(),
            to: target,
            files_migrated: 0,
            records_migrated: 0,
            files_remaining: to_migrate.len(),
            backup_path: None,
            completed: false,
        };

        let previous_format = io.write_format;
        if to_migrate.is_empty() {
            io.write_format = target;
            io.index.format_version = target;
            io.index.save(&self.dir).await?;
            report.completed = true;
            tracing::info!(%target, "trajectory store already at target version");
            return Ok(report);
        }

        let backup = if options.skip_backup {
            None
        } else {
            let path = options
                .backup_dir
                .clone()
                .unwrap_or_else(|| default_backup_dir(&self.dir));
            copy_files(&self.dir, &path).await.map_err(|e| {
                StorageError::BackupFailed(format!("{}: {e}", path.display()))
            })?;
            tracing::info!(backup = %path.display(), "backed up trajectory store");
            Some(path)
        };

        io.write_format = target;
        let budget = options.max_files.unwrap_or(usize::MAX);
        let outcome = self
            .migrate_files(&mut io, &to_migrate, budget, &options, &mut report)
            .await;

        if let Err(e) = outcome {
            io.write_format = previous_format;
            tracing::error!(%target, error = %e, "migration failed; restoring backup");
            if let Some(backup) = &backup {
                match restore_files(backup, &self.dir, previous_format).await {
                    Ok(index) => io.index = index,
                    Err(restore) => {
                        return Err(StorageError::MigrationFailed {
                            target: target.as_u8(),
                            reason: format!(
                                "{e}; restoring {} also failed: {restore}",
                                backup.display()
                            ),
                        })
                    }
                }
            }
            return Err(StorageError::MigrationFailed {
                target: target.as_u8(),
                reason: e.to_string(),
            });
        }

        report.files_remaining = to_migrate.len() - report.files_migrated;
        report.completed = report.files_remaining == 0;
        if report.completed {
            io.index.format_version = target;
            io.index.save(&self.dir).await?;
        }

        match backup {
            Some(path) if report.completed && !options.keep_backup => {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(backup = %path.display(), error = %e, "failed to remove migration backup");
                    report.backup_path = Some(path);
                }
            }
            other => report.backup_path = other,
        }

        tracing::info!(
            %target,
            files = report.files_migrated,
            records = report.records_migrated,
            remaining = report.files_remaining,
            "migrated trajectory store"
        );
        Ok(report)
    }

    async fn migrate_files(
        &self,
        io: &mut IoState,
        to_migrate: &[u32],
        budget: usize,
        options: &MigrationOptions,
        report: &mut MigrationReport,
    ) -> StorageResult<()> {
        for &file_id in to_migrate.iter().take(budget) {
            let mut next = io.index.clone();
            let rewrite = self.rewrite_file(&mut next, file_id, Some(report.to)).await?;
            next.format_version = io.write_format;
            next.updated_at = Utc::now();
            next.save(&self.dir).await?;
            io.index = next;
            self.remove_files(&[file_id]).await;

            report.files_migrated += 1;
            report.records_migrated += rewrite.records;
            if let Some(progress) = &options.progress {
                progress(&MigrationProgress {
                    files_done: report.files_migrated,
                    files_total: to_migrate.len(),
                    records_done: report.records_migrated,
                });
            }
        }
        Ok(())
    }
}

fn default_backup_dir(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trajectories".into());
    dir.with_file_name(format!(
        "{name}.backup-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f")
    ))
}

/// Copy the regular files of `from` into `to`, creating `to`.
async fn copy_files(from: &Path, to: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(to).await?;
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), to.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

/// Replace the store's files with the backup's and reload its index.
async fn restore_files(
    backup: &Path,
    dir: &Path,
    version: FormatVersion,
) -> StorageResult<TrajectoryIndex> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    copy_files(backup, dir).await?;

    match TrajectoryIndex::load(dir).await {
        Ok(Some(index)) => Ok(index),
        Ok(None) | Err(StorageError::IndexCorrupted(_)) => {
            let index = TrajectoryIndex::rebuild(dir, version).await?;
            index.save(dir).await?;
            Ok(index)
        }
        Err(e) => Err(e),
    }
}
