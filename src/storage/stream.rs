//! The trajectory stream manager.
//!
//! Writes land in a bounded hot window. Entries pushed out of the window while dirty
//! join a pending queue that is flushed in batches to append-only data files; the index
//! is rewritten atomically after every flush.
//!
//! Locking: `io` (tokio `RwLock`, the flush mutex when held for writing) is always
//! taken before `inner` (parking_lot `Mutex`), and `inner` is never held across an await.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use super::data_file::{self, corrupted, FileHeader};
use super::guard::{BaselineGuard, NoBaselineGuard};
use super::index::{FileStats, IndexEntry, TrajectoryIndex};
use super::memory::{MemoryGuard, MemoryProbe, ProcMemoryProbe};
use super::record::{self, FormatVersion, Record};
use super::window::HotWindow;
use super::{
    write_atomic, CompactReport, DeleteOutcome, FlushReport, PruneReport, StreamStats,
    TrajectoryFilter,
};
use crate::config::StreamConfig;
use crate::error::{StorageError, StorageResult};
use crate::learning::types::Trajectory;
use crate::telemetry::{OpTimer, Telemetry, TracingTelemetry};

/// Collaborators injected into the stream.
#[derive(Clone)]
pub struct StreamDeps {
    pub memory_probe: Arc<dyn MemoryProbe>,
    pub baseline_guard: Arc<dyn BaselineGuard>,
    pub telemetry: Arc<dyn Telemetry>,
}

impl StreamDeps {
    pub fn for_config(config: &StreamConfig) -> Self {
        Self {
            memory_probe: Arc::new(ProcMemoryProbe::new(config.memory_budget_mb)),
            baseline_guard: Arc::new(NoBaselineGuard),
            telemetry: Arc::new(TracingTelemetry),
        }
    }
}

pub(super) struct Inner {
    pub(super) window: HotWindow,
    pub(super) pending: VecDeque<Trajectory>,
    last_flush: Instant,
}

pub(super) struct IoState {
    pub(super) index: TrajectoryIndex,
    pub(super) write_format: FormatVersion,
}

/// Result of rewriting one data file's live records into a fresh file.
#[derive(Debug, Default)]
pub(super) struct Rewrite {
    pub(super) new_file: Option<u32>,
    pub(super) records: usize,
    pub(super) old_bytes: u64,
    pub(super) new_bytes: u64,
}

struct FileCursor {
    file: u32,
    start: u64,
    buf: Vec<u8>,
}

impl FileCursor {
    fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }
}

/// Decrements the waiting-query counter however the wait ends.
struct QueueTicket<'a>(&'a AtomicUsize);

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TrajectoryStreamManager {
    pub(super) dir: PathBuf,
    pub(super) config: StreamConfig,
    pub(super) inner: Mutex<Inner>,
    pub(super) io: RwLock<IoState>,
    query_slots: Semaphore,
    waiting_queries: AtomicUsize,
    memory: MemoryGuard,
    baseline_guard: Arc<dyn BaselineGuard>,
    pub(super) telemetry: Arc<dyn Telemetry>,
}

impl TrajectoryStreamManager {
    /// Open (or create) a store in `dir`. A missing, unparsable or inconsistent index
    /// is rebuilt from the data files.
    pub async fn open(
        dir: impl Into<PathBuf>,
        config: StreamConfig,
        deps: StreamDeps,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let write_format = config.write_format();
        let index = load_or_rebuild_index(&dir, write_format).await?;

        tracing::info!(
            dir = %dir.display(),
            on_disk = index.entries.len(),
            files = index.files.len(),
            format = %write_format,
            "trajectory stream opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                window: HotWindow::new(config.memory_window_size),
                pending: VecDeque::new(),
                last_flush: Instant::now(),
            }),
            io: RwLock::new(IoState {
                index,
                write_format,
            }),
            query_slots: Semaphore::new(config.max_concurrent_queries.max(1)),
            waiting_queries: AtomicUsize::new(0),
            memory: MemoryGuard::new(deps.memory_probe, config.memory_pressure_ratio),
            baseline_guard: deps.baseline_guard,
            telemetry: deps.telemetry,
            config,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Accept a new trajectory into the hot window. Flushes when the pending queue
    /// reaches the batch size or the flush interval has elapsed.
    pub async fn add_trajectory(&self, trajectory: Trajectory) -> StorageResult<()> {
        self.memory.check()?;
        if self.stage(trajectory) {
            self.auto_flush().await;
        }
        Ok(())
    }

    /// Store a new version of a known trajectory. On-disk copies are superseded by
    /// re-appending at the next flush.
    pub async fn update_trajectory(&self, trajectory: Trajectory) -> StorageResult<()> {
        if self.stage(trajectory) {
            self.auto_flush().await;
        }
        Ok(())
    }

    fn stage(&self, trajectory: Trajectory) -> bool {
        let mut inner = self.inner.lock();
        let id = trajectory.id.clone();
        inner.pending.retain(|t| t.id != id);
        for evicted in inner.window.put(trajectory, true) {
            if evicted.dirty {
                inner.pending.push_back(evicted.trajectory);
            }
        }
        !inner.pending.is_empty()
            && (inner.pending.len() >= self.config.batch_write_size.max(1)
                || inner.last_flush.elapsed() >= self.config.flush_interval())
    }

    async fn auto_flush(&self) {
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, code = e.code(), "scheduled flush failed; batch stays queued");
        }
    }

    /// Hot window and pending queue first; otherwise a single slice read of the data
    /// file the index points at.
    pub async fn get_trajectory(&self, id: &str) -> StorageResult<Option<Trajectory>> {
        if let Some(found) = self.lookup_memory(id) {
            return Ok(Some(found));
        }
        self.memory.check()?;
        let _permit = self.query_slot().await?;

        let io = self.io.read().await;
        let found = self.read_indexed(&io, id).await?;
        drop(io);

        // a failed flush may have re-queued it while we waited for the reader lock
        Ok(found.or_else(|| self.lookup_memory(id)))
    }

    fn lookup_memory(&self, id: &str) -> Option<Trajectory> {
        let inner = self.inner.lock();
        inner
            .window
            .get(id)
            .or_else(|| inner.pending.iter().rev().find(|t| t.id == id))
            .cloned()
    }

    async fn query_slot(&self) -> StorageResult<SemaphorePermit<'_>> {
        if let Ok(permit) = self.query_slots.try_acquire() {
            return Ok(permit);
        }
        let waiting = self.waiting_queries.fetch_add(1, Ordering::SeqCst);
        let _ticket = QueueTicket(&self.waiting_queries);
        if waiting >= self.config.max_query_queue {
            tracing::warn!(waiting, limit = self.config.max_query_queue, "query queue full");
            return Err(StorageError::QueryQueueFull { waiting });
        }
        self.query_slots
            .acquire()
            .await
            .map_err(|_| StorageError::QueryQueueFull { waiting })
    }

    async fn read_indexed(&self, io: &IoState, id: &str) -> StorageResult<Option<Trajectory>> {
        let Some(entry) = io.index.entries.get(id).copied() else {
            return Ok(None);
        };
        let version = io
            .index
            .files
            .get(&entry.file)
            .map(|s| s.version)
            .ok_or_else(|| {
                StorageError::IndexCorrupted(format!("{id} points at unknown file {}", entry.file))
            })?;
        let bytes = data_file::read_at(&self.dir, entry.file, entry.offset, entry.length).await?;
        match record::decode_record(&bytes, version) {
            Ok(Record::Put { trajectory }) if trajectory.id == id => Ok(Some(trajectory)),
            Ok(other) => Err(corrupted(
                entry.file,
                entry.offset,
                format!("expected {id}, found a record for {}", other.id()),
            )),
            Err(reason) => Err(corrupted(entry.file, entry.offset, reason)),
        }
    }

    /// Write every pending trajectory. On failure the batch goes back to the front of
    /// the queue, minus entries that were superseded in the meantime. Entries still held
    /// by the hot window are flagged dirty there instead.
    pub async fn flush(&self) -> StorageResult<FlushReport> {
        let timer = OpTimer::start("stream", "flush");
        let result = self.flush_pending().await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    async fn flush_pending(&self) -> StorageResult<FlushReport> {
        let mut io = self.io.write().await;
        let batch: Vec<Trajectory> = {
            let mut inner = self.inner.lock();
            inner.last_flush = Instant::now();
            inner.pending.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let records: Vec<Record> = batch
            .iter()
            .map(|t| Record::Put { trajectory: t.clone() })
            .collect();
        let version = io.write_format;
        match self.append_records(&mut io, &records, version).await {
            Ok(report) => {
                tracing::debug!(written = report.written, files = report.files_touched, "flushed trajectories");
                Ok(report)
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                for t in batch.into_iter().rev() {
                    if inner.pending.iter().any(|p| p.id == t.id) {
                        continue;
                    }
                    // the window copy is at least as new; make sure it gets written
                    if !inner.window.mark_dirty(&t.id) {
                        inner.pending.push_front(t);
                    }
                }
                Err(e)
            }
        }
    }

    /// Append records to the active file, rolling at the per-file cap, then save the index.
    async fn append_records(
        &self,
        io: &mut IoState,
        records: &[Record],
        version: FormatVersion,
    ) -> StorageResult<FlushReport> {
        if records.is_empty() {
            return Ok(FlushReport::default());
        }
        let max_per_file = self.config.max_records_per_file.max(1);
        let mut next = io.index.clone();
        let mut cursor = self.open_active(&mut next, version).await?;
        let mut files_touched = 1;

        for record in records {
            let full = next
                .files
                .get(&cursor.file)
                .map_or(true, |s| s.records >= max_per_file);
            if full {
                self.write_cursor(&cursor).await?;
                cursor = self.roll_file(&mut next, version).await?;
                files_touched += 1;
            }

            let bytes = record::encode_record(record, version, self.config.compression)?;
            let entry = IndexEntry {
                file: cursor.file,
                offset: cursor.end(),
                length: bytes.len() as u32,
            };
            cursor.buf.extend_from_slice(&bytes);
            if let Some(stats) = next.files.get_mut(&cursor.file) {
                stats.records += 1;
                stats.bytes = cursor.end();
            }
            next.apply(record, entry);
        }
        self.write_cursor(&cursor).await?;

        next.format_version = io.write_format;
        next.updated_at = Utc::now();
        next.save(&self.dir).await?;
        io.index = next;
        Ok(FlushReport {
            written: records.len(),
            files_touched,
        })
    }

    async fn open_active(
        &self,
        next: &mut TrajectoryIndex,
        version: FormatVersion,
    ) -> StorageResult<FileCursor> {
        if let Some(file) = next.active_file {
            let indexed = next
                .files
                .get(&file)
                .filter(|s| s.version == version && s.records < self.config.max_records_per_file.max(1))
                .map(|s| s.bytes);
            if let Some(indexed) = indexed {
                match self.trim_to_indexed(file, indexed).await {
                    Ok(()) => {
                        return Ok(FileCursor {
                            file,
                            start: indexed,
                            buf: Vec::new(),
                        })
                    }
                    Err(e) => {
                        tracing::warn!(file, error = %e, "active data file unusable; rolling")
                    }
                }
            }
        }
        self.roll_file(next, version).await
    }

    /// Appends always start where the index says the file ends. Bytes past that point
    /// (a failed flush or a torn write) are cut off; a file shorter than its index is
    /// refused.
    async fn trim_to_indexed(&self, file: u32, indexed: u64) -> StorageResult<()> {
        let actual = data_file::len(&self.dir, file).await?;
        if actual < indexed {
            return Err(corrupted(file, actual, format!("file ends before indexed length {indexed}")));
        }
        if actual > indexed {
            tracing::warn!(file, indexed, actual, "discarding unindexed tail of active data file");
            data_file::truncate(&self.dir, file, indexed).await?;
        }
        Ok(())
    }

    async fn roll_file(
        &self,
        next: &mut TrajectoryIndex,
        version: FormatVersion,
    ) -> StorageResult<FileCursor> {
        let file = next.next_file_id();
        let header = FileHeader {
            version,
            compressed: self.config.compression && version == FormatVersion::V2,
        };
        let start = data_file::create(&self.dir, file, header).await?;
        next.files.insert(
            file,
            FileStats {
                version,
                records: 0,
                bytes: start,
            },
        );
        next.active_file = Some(file);
        tracing::debug!(file, %version, "rolled to new data file");
        Ok(FileCursor {
            file,
            start,
            buf: Vec::new(),
        })
    }

    async fn write_cursor(&self, cursor: &FileCursor) -> StorageResult<()> {
        if cursor.buf.is_empty() {
            return Ok(());
        }
        data_file::append(&self.dir, cursor.file, &cursor.buf).await
    }

    /// Delete one trajectory. A trajectory backing the last baseline checkpoint needs
    /// `force`. The on-disk slot is reclaimed by [`compact`](Self::compact).
    pub async fn delete_trajectory(&self, id: &str, force: bool) -> StorageResult<DeleteOutcome> {
        let protected = self.baseline_guard.protects(id);
        if protected && !force {
            return Err(StorageError::DeleteBaseline { id: id.to_string() });
        }
        if protected {
            tracing::warn!(trajectory = id, "force-deleting a trajectory that backs the last baseline");
        }
        let removed = self.delete_many(&[id.to_string()]).await?;
        Ok(DeleteOutcome {
            deleted: removed > 0,
            forced_baseline: protected && removed > 0,
        })
    }

    /// Tombstones go to disk first so memory is only touched once the delete is durable.
    async fn delete_many(&self, ids: &[String]) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut io = self.io.write().await;
        let tombstones: Vec<Record> = ids
            .iter()
            .filter(|id| io.index.entries.contains_key(id.as_str()))
            .map(|id| Record::Delete { id: id.clone() })
            .collect();
        let mut removed: HashSet<String> = tombstones.iter().map(|r| r.id().to_string()).collect();
        let version = io.write_format;
        self.append_records(&mut io, &tombstones, version).await?;

        let targets: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut inner = self.inner.lock();
        for id in ids {
            if inner.window.remove(id).is_some() {
                removed.insert(id.clone());
            }
        }
        inner.pending.retain(|t| {
            if targets.contains(t.id.as_str()) {
                removed.insert(t.id.clone());
                false
            } else {
                true
            }
        });
        Ok(removed.len())
    }

    /// Bulk delete by filter. At most `max_prune_per_call` (or `limit`, if lower)
    /// trajectories are removed per call; baseline-backing ones are skipped.
    pub async fn prune_trajectories(
        &self,
        filter: &TrajectoryFilter,
        limit: Option<usize>,
    ) -> StorageResult<PruneReport> {
        let timer = OpTimer::start("stream", "prune");
        let result = self.prune_inner(filter, limit).await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    async fn prune_inner(
        &self,
        filter: &TrajectoryFilter,
        limit: Option<usize>,
    ) -> StorageResult<PruneReport> {
        let cap = limit
            .unwrap_or(usize::MAX)
            .min(self.config.max_prune_per_call);
        let matched = self.list_trajectories(filter).await?;

        let mut report = PruneReport {
            matched: matched.len(),
            ..Default::default()
        };
        let mut selected = Vec::new();
        for t in matched {
            if self.baseline_guard.protects(&t.id) {
                report.skipped_protected += 1;
            } else if selected.len() < cap {
                selected.push(t.id);
            } else {
                report.truncated = true;
            }
        }

        report.removed = self.delete_many(&selected).await?;
        tracing::info!(
            matched = report.matched,
            removed = report.removed,
            skipped_protected = report.skipped_protected,
            truncated = report.truncated,
            "pruned trajectories"
        );
        Ok(report)
    }

    /// Every stored trajectory matching `filter`: memory first, then the indexed records
    /// of each data file.
    pub async fn list_trajectories(&self, filter: &TrajectoryFilter) -> StorageResult<Vec<Trajectory>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        {
            let inner = self.inner.lock();
            for t in inner.window.iter().chain(inner.pending.iter().rev()) {
                if seen.insert(t.id.clone()) && filter.matches(t) {
                    out.push(t.clone());
                }
            }
        }

        self.memory.check()?;
        let _permit = self.query_slot().await?;
        let io = self.io.read().await;
        for (&file_id, stats) in &io.index.files {
            let live: Vec<(String, IndexEntry)> = io
                .index
                .entries_in(file_id)
                .into_iter()
                .filter(|(id, _)| !seen.contains(id))
                .collect();
            if live.is_empty() {
                continue;
            }
            let bytes = tokio::fs::read(data_file::file_path(&self.dir, file_id)).await?;
            for (id, entry) in live {
                let start = entry.offset as usize;
                let slice = bytes
                    .get(start..start + entry.length as usize)
                    .ok_or_else(|| corrupted(file_id, entry.offset, "indexed record past end of file"))?;
                match record::decode_record(slice, stats.version) {
                    Ok(Record::Put { trajectory }) if trajectory.id == id => {
                        if filter.matches(&trajectory) {
                            out.push(trajectory);
                        }
                    }
                    Ok(_) => return Err(corrupted(file_id, entry.offset, format!("index entry for {id} points at another record"))),
                    Err(reason) => return Err(corrupted(file_id, entry.offset, reason)),
                }
            }
        }
        Ok(out)
    }

    /// Rewrite data files that hold dead records (superseded versions and tombstones)
    /// so they contain only live records. Files with nothing live are removed.
    pub async fn compact(&self) -> StorageResult<CompactReport> {
        let timer = OpTimer::start("stream", "compact");
        let result = self.compact_inner().await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    async fn compact_inner(&self) -> StorageResult<CompactReport> {
        let mut io = self.io.write().await;
        let mut next = io.index.clone();
        let live = next.live_counts();
        let mut report = CompactReport::default();
        let mut obsolete = Vec::new();
        let mut created = Vec::new();

        let candidates: Vec<u32> = next
            .files
            .iter()
            .filter(|(id, stats)| live.get(id).copied().unwrap_or(0) < stats.records as usize)
            .map(|(id, _)| *id)
            .collect();

        for file_id in candidates {
            match self.rewrite_file(&mut next, file_id, None).await {
                Ok(rewrite) => {
                    match rewrite.new_file {
                        Some(new_file) => {
                            created.push(new_file);
                            report.files_rewritten += 1;
                        }
                        None => report.files_removed += 1,
                    }
                    report.bytes_reclaimed += rewrite.old_bytes.saturating_sub(rewrite.new_bytes);
                    obsolete.push(file_id);
                }
                Err(e) => {
                    self.remove_files(&created).await;
                    return Err(e);
                }
            }
        }

        if obsolete.is_empty() && next.tombstones == 0 {
            return Ok(report);
        }
        next.tombstones = 0;
        next.updated_at = Utc::now();
        if let Err(e) = next.save(&self.dir).await {
            self.remove_files(&created).await;
            return Err(e);
        }
        io.index = next;
        drop(io);

        self.remove_files(&obsolete).await;
        tracing::info!(
            rewritten = report.files_rewritten,
            removed = report.files_removed,
            bytes_reclaimed = report.bytes_reclaimed,
            "compacted trajectory store"
        );
        Ok(report)
    }

    /// Copy the live records of `file_id` into a new, highest-numbered file, re-encoding
    /// them when `target` is given. Updates `next` but leaves the old file on disk for the
    /// caller to delete once `next` is saved.
    pub(super) async fn rewrite_file(
        &self,
        next: &mut TrajectoryIndex,
        file_id: u32,
        target: Option<FormatVersion>,
    ) -> StorageResult<Rewrite> {
        let Some(stats) = next.files.get(&file_id).copied() else {
            return Ok(Rewrite::default());
        };
        let live = next.entries_in(file_id);
        let new_file = next.next_file_id();
        let mut rewrite = Rewrite {
            records: live.len(),
            old_bytes: stats.bytes,
            ..Default::default()
        };

        if live.is_empty() {
            next.files.remove(&file_id);
            if next.active_file == Some(file_id) {
                next.active_file = next.files.keys().next_back().copied();
            }
            return Ok(rewrite);
        }

        let bytes = tokio::fs::read(data_file::file_path(&self.dir, file_id)).await?;
        let header = data_file::parse_header(file_id, &bytes)?;
        let new_header = match target {
            Some(version) => FileHeader {
                version,
                compressed: self.config.compression && version == FormatVersion::V2,
            },
            None => header,
        };

        let mut out = new_header.to_bytes().to_vec();
        for (id, entry) in &live {
            let start = entry.offset as usize;
            let slice = bytes
                .get(start..start + entry.length as usize)
                .ok_or_else(|| corrupted(file_id, entry.offset, "indexed record past end of file"))?;
            let encoded = match target {
                None => slice.to_vec(),
                Some(version) => {
                    let record = record::decode_record(slice, header.version)
                        .map_err(|reason| corrupted(file_id, entry.offset, reason))?;
                    if record.id() != id {
                        return Err(corrupted(
                            file_id,
                            entry.offset,
                            format!("index entry for {id} points at another record"),
                        ));
                    }
                    record::encode_record(&record, version, self.config.compression)?
                }
            };
            next.entries.insert(
                id.clone(),
                IndexEntry {
                    file: new_file,
                    offset: out.len() as u64,
                    length: encoded.len() as u32,
                },
            );
            out.extend_from_slice(&encoded);
        }

        write_atomic(&data_file::file_path(&self.dir, new_file), &out).await?;
        next.files.remove(&file_id);
        next.files.insert(
            new_file,
            FileStats {
                version: new_header.version,
                records: live.len() as u32,
                bytes: out.len() as u64,
            },
        );
        next.active_file = Some(new_file);
        rewrite.new_file = Some(new_file);
        rewrite.new_bytes = out.len() as u64;
        Ok(rewrite)
    }

    pub(super) async fn remove_files(&self, files: &[u32]) {
        for &file in files {
            let path = data_file::file_path(&self.dir, file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove data file");
            }
        }
    }

    /// Discard the index and rebuild it by rescanning every data file.
    pub async fn rebuild_index(&self) -> StorageResult<usize> {
        let mut io = self.io.write().await;
        let mut index = TrajectoryIndex::rebuild(&self.dir, io.write_format).await?;
        index.format_version = io.write_format;
        index.save(&self.dir).await?;
        let entries = index.entries.len();
        io.index = index;
        Ok(entries)
    }

    pub async fn stats(&self) -> StreamStats {
        let io = self.io.read().await;
        let inner = self.inner.lock();
        StreamStats {
            hot: inner.window.len(),
            hot_dirty: inner.window.dirty_count(),
            pending: inner.pending.len(),
            on_disk: io.index.entries.len(),
            files: io.index.files.len(),
            bytes: io.index.total_bytes(),
            tombstones: io.index.tombstones,
            format_version: io.write_format,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Queue every unsaved hot-window entry and flush.
    pub async fn close(&self) -> StorageResult<FlushReport> {
        {
            let mut inner = self.inner.lock();
            for t in inner.window.take_dirty() {
                if !inner.pending.iter().any(|p| p.id == t.id) {
                    inner.pending.push_back(t);
                }
            }
        }
        self.flush().await
    }

    /// Flush on the configured interval until the returned handle is dropped.
    pub fn start_flush_timer(self: &Arc<Self>) -> FlushTimer {
        let stream = Arc::downgrade(self);
        let period = self.config.flush_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stream) = stream.upgrade() else {
                    break;
                };
                if stream.pending_len() > 0 {
                    stream.auto_flush().await;
                }
            }
        });
        FlushTimer { handle }
    }
}

/// Aborts the background flush task on drop.
pub struct FlushTimer {
    handle: JoinHandle<()>,
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn load_or_rebuild_index(dir: &Path, version: FormatVersion) -> StorageResult<TrajectoryIndex> {
    match TrajectoryIndex::load(dir).await {
        Ok(Some(index)) => match index.validate(dir).await {
            Ok(()) => return Ok(index),
            Err(e) => tracing::warn!(error = %e, "trajectory index is inconsistent; rebuilding"),
        },
        Ok(None) => {
            if data_file::list_files(dir).await?.is_empty() {
                return Ok(TrajectoryIndex::new(version));
            }
            tracing::warn!("trajectory index missing; rebuilding from data files");
        }
        Err(e @ StorageError::IndexCorrupted(_)) => {
            tracing::warn!(error = %e, code = e.code(), "trajectory index corrupted; rebuilding")
        }
        Err(e) => return Err(e),
    }
    let mut index = TrajectoryIndex::rebuild(dir, version).await?;
    index.format_version = version;
    index.save(dir).await?;
    Ok(index)
}
