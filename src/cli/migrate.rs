//! CLI `migrate` command: re-encode trajectory files into another format version.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StrataConfig;
use crate::storage::{FormatVersion, MigrationOptions, MigrationProgress};

pub struct MigrateArgs {
    pub to: u8,
    pub backup_dir: Option<PathBuf>,
    pub no_backup: bool,
    pub keep_backup: bool,
    pub max_files: Option<usize>,
}

pub async fn migrate(config: &StrataConfig, args: MigrateArgs) -> Result<()> {
    let target = FormatVersion::try_from(args.to).context("invalid --to version")?;

    // New writes should already use the target format while the engine is open.
    let mut config = config.clone();
    config.stream.format_version = target.as_u8();
    let engine = super::open_engine(&config).await?;

    let versions = engine.stream().detect_versions().await?;
    let found: Vec<String> = versions.iter().map(ToString::to_string).collect();
    println!("Found formats: {}", if found.is_empty() { "(none)".to_string() } else { found.join(", ") });

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} files {msg}")
            .expect("valid template")
            .progress_chars("##-"),
    );
    let bar = pb.clone();
    let options = MigrationOptions {
        backup_dir: args.backup_dir,
        skip_backup: args.no_backup,
        keep_backup: args.keep_backup,
        max_files: args.max_files,
        progress: Some(Arc::new(move |p: &MigrationProgress| {
            bar.set_length(p.files_total as u64);
            bar.set_position(p.files_done as u64);
            bar.set_message(format!("({} records)", p.records_done));
        })),
    };

    let result = engine.stream().migrate_to_version(target, options).await;
    pb.finish_and_clear();
    let report = result?;

    println!(
        "Migrated {} files ({} records) to {}.",
        report.files_migrated, report.records_migrated, report.to
    );
    if let Some(ref backup) = report.backup_path {
        println!("Backup kept at {}", backup.display());
    }
    if !report.completed {
        println!("{} files still use older formats; run migrate again to continue.", report.files_remaining);
    }

    super::close_engine(engine).await
}
