//! The trajectory index: the only authority on which trajectories exist on disk.
//!
//! Saved as `index.json` by writing `index.json.tmp` and renaming over the old file, so
//! a crash mid-save leaves the previous index intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::data_file;
use super::record::{FormatVersion, Record};
use crate::error::{StorageError, StorageResult};

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file: u32,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub version: FormatVersion,
    /// Records written to the file, live or not.
    pub records: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryIndex {
    pub format_version: FormatVersion,
    pub active_file: Option<u32>,
    pub files: BTreeMap<u32, FileStats>,
    pub entries: HashMap<String, IndexEntry>,
    /// Tombstone records written since the last compaction.
    pub tombstones: u64,
    pub updated_at: DateTime<Utc>,
}

impl TrajectoryIndex {
    pub fn new(format_version: FormatVersion) -> Self {
        Self {
            format_version,
            active_file: None,
            files: BTreeMap::new(),
            entries: HashMap::new(),
            tombstones: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    /// `Ok(None)` when no index exists; an unparsable index is `IndexCorrupted`.
    pub async fn load(dir: &Path) -> StorageResult<Option<Self>> {
        let bytes = match tokio::fs::read(Self::path(dir)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::IndexCorrupted(format!("unparsable index: {e}")))
    }

    pub async fn save(&self, dir: &Path) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        super::write_atomic(&Self::path(dir), &json).await?;
        Ok(())
    }

    /// Check the index against the data files on disk: every referenced file exists,
    /// every entry lies inside its file, and no data file is missing from the index.
    pub async fn validate(&self, dir: &Path) -> StorageResult<()> {
        let on_disk = data_file::list_files(dir).await?;
        for id in &on_disk {
            if !self.files.contains_key(id) {
                return Err(StorageError::IndexCorrupted(format!(
                    "data file {} is not indexed",
                    data_file::file_name(*id)
                )));
            }
        }

        let mut lengths = HashMap::with_capacity(self.files.len());
        for id in self.files.keys() {
            let len = data_file::len(dir, *id).await.map_err(|_| {
                StorageError::IndexCorrupted(format!(
                    "indexed file {} is missing",
                    data_file::file_name(*id)
                ))
            })?;
            lengths.insert(*id, len);
        }

        for (id, entry) in &self.entries {
            let len = lengths.get(&entry.file).copied().ok_or_else(|| {
                StorageError::IndexCorrupted(format!("{id} points at unknown file {}", entry.file))
            })?;
            if entry.offset < data_file::HEADER_LEN || entry.offset + entry.length as u64 > len {
                return Err(StorageError::IndexCorrupted(format!(
                    "{id} points outside {} ({}+{} > {len})",
                    data_file::file_name(entry.file),
                    entry.offset,
                    entry.length
                )));
            }
        }
        Ok(())
    }

    /// Rebuild from a full rescan of the data files. Later records for the same ID win
    /// and tombstones delete. A torn tail is logged and ignored.
    pub async fn rebuild(dir: &Path, default_version: FormatVersion) -> StorageResult<Self> {
        let mut index = Self::new(default_version);
        for file_id in data_file::list_files(dir).await? {
            let bytes = tokio::fs::read(data_file::file_path(dir, file_id)).await?;
            let scan = match data_file::scan(file_id, &bytes) {
                Ok(scan) => scan,
                Err(e) => {
                    tracing::warn!(file = file_id, error = %e, "skipping unreadable data file during rebuild");
                    continue;
                }
            };
            // the file ends, as far as the index is concerned, before an undecodable tail
            let bytes = match &scan.truncated_at {
                Some((offset, reason)) => {
                    tracing::warn!(file = file_id, offset, %reason, "data file has an undecodable tail");
                    *offset
                }
                None => scan.len,
            };

            for scanned in &scan.records {
                let entry = IndexEntry {
                    file: file_id,
                    offset: scanned.offset,
                    length: scanned.length,
                };
                index.apply(&scanned.record, entry);
            }
            index.files.insert(
                file_id,
                FileStats {
                    version: scan.header.version,
                    records: scan.records.len() as u32,
                    bytes,
                },
            );
            index.active_file = Some(file_id);
            index.format_version = scan.header.version;
        }
        index.updated_at = Utc::now();
        tracing::info!(
            files = index.files.len(),
            entries = index.entries.len(),
            "rebuilt trajectory index"
        );
        Ok(index)
    }

    /// Apply one written record at `entry`.
    pub fn apply(&mut self, record: &Record, entry: IndexEntry) {
        match record {
            Record::Put { trajectory } => {
                self.entries.insert(trajectory.id.clone(), entry);
            }
            Record::Delete { id } => {
                self.entries.remove(id);
                self.tombstones += 1;
            }
        }
    }

    pub fn next_file_id(&self) -> u32 {
        self.files.keys().next_back().map_or(0, |id| id + 1)
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|s| s.bytes).sum()
    }

    /// Live entries per file, keyed by file ID.
    pub fn live_counts(&self) -> BTreeMap<u32, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.file).or_insert(0) += 1;
        }
        counts
    }

    /// Live `(id, entry)` pairs stored in `file_id`, in file order.
    pub fn entries_in(&self, file_id: u32) -> Vec<(String, IndexEntry)> {
        let mut live: Vec<(String, IndexEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.file == file_id)
            .map(|(id, e)| (id.clone(), *e))
            .collect();
        live.sort_by_key(|(_, e)| e.offset);
        live
    }
}
