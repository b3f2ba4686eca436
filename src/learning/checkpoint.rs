//! Checkpoint retention: snapshots of the weight store kept in a bounded ring.
//!
//! Every checkpoint is a deep copy of weights, Fisher information and route statistics,
//! persisted as one file per checkpoint (`{id}.ckpt`) with the weight-file codec. The ring
//! is pruned oldest-first, but baseline checkpoints are never auto-pruned and the last
//! baseline can be neither unmarked nor deleted.
//!
//! A baseline without a single non-zero weight (the one taken on a fresh install) is a
//! placeholder: drift is not measured against it, and the first baseline that carries
//! weights demotes it to an ordinary checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::codec::{self, WeightFile, WeightFileMetadata};
use super::update::RouteStats;
use super::weights::WeightStore;
use crate::error::{LearningError, LearningResult};

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Identity and provenance of a checkpoint, stored in the file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub is_baseline: bool,
    /// Trajectories whose feedback was folded in since the previous checkpoint.
    #[serde(default)]
    pub trajectory_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub weights: WeightStore,
    pub route_stats: BTreeMap<String, RouteStats>,
}

impl Checkpoint {
    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn is_baseline(&self) -> bool {
        self.header.is_baseline
    }

    /// Holds at least one non-zero weight.
    pub fn is_trained(&self) -> bool {
        has_weights(&self.weights)
    }

    fn to_file(&self) -> WeightFile {
        WeightFile {
            metadata: WeightFileMetadata {
                saved_at: Utc::now(),
                route_stats: self.route_stats.clone(),
                checkpoint: Some(self.header.clone()),
            },
            store: self.weights.clone(),
        }
    }

    fn from_file(file: WeightFile) -> Option<Self> {
        let header = file.metadata.checkpoint?;
        Some(Self {
            header,
            weights: file.store,
            route_stats: file.metadata.route_stats,
        })
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.header.id.clone(),
            reason: self.header.reason.clone(),
            created_at: self.header.created_at,
            is_baseline: self.header.is_baseline,
            entries: self.weights.len(),
            trajectories: self.header.trajectory_ids.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub is_baseline: bool,
    pub entries: usize,
    pub trajectories: usize,
}

/// Inputs for a new checkpoint.
pub struct CheckpointRequest<'a> {
    pub reason: &'a str,
    pub weights: WeightStore,
    pub route_stats: BTreeMap<String, RouteStats>,
    pub trajectory_ids: Vec<String>,
    pub mark_as_baseline: bool,
}

pub struct CheckpointStore {
    dir: PathBuf,
    max_checkpoints: usize,
    /// Oldest first.
    checkpoints: Vec<Checkpoint>,
    last_millis: i64,
    seq: u32,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoints: max_checkpoints.max(1),
            checkpoints: Vec::new(),
            last_millis: 0,
            seq: 0,
        }
    }

    /// Load every checkpoint file in `dir`. Unreadable or corrupted files are skipped
    /// with a warning so one bad file cannot block startup.
    pub async fn load_all(dir: impl Into<PathBuf>, max_checkpoints: usize) -> LearningResult<Self> {
        let mut store = Self::new(dir, max_checkpoints);
        tokio::fs::create_dir_all(&store.dir).await.map_err(|e| {
            LearningError::Checkpoint(format!("failed to create {}: {e}", store.dir.display()))
        })?;

        for (path, result) in scan_dir(&store.dir).await? {
            match result {
                Ok(checkpoint) => store.checkpoints.push(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint")
                }
            }
        }
        store
            .checkpoints
            .sort_by(|a, b| id_key(&a.header.id).cmp(&id_key(&b.header.id)));

        if let Some(latest) = store.checkpoints.last() {
            let (millis, seq) = parse_id(&latest.header.id).unwrap_or((0, 0));
            store.last_millis = millis;
            store.seq = seq;
        }

        tracing::info!(
            dir = %store.dir.display(),
            checkpoints = store.checkpoints.len(),
            baselines = store.baseline_count(),
            "checkpoints loaded"
        );
        Ok(store)
    }

    /// Decode every checkpoint file without loading them into a store (used by `doctor`).
    pub async fn verify_dir(dir: &Path) -> LearningResult<Vec<(PathBuf, LearningResult<CheckpointHeader>)>> {
        Ok(scan_dir(dir)
            .await?
            .into_iter()
            .map(|(path, result)| (path, result.map(|c| c.header)))
            .collect())
    }

    /// Deep-copy the given state into a new checkpoint, persist it, then prune.
    ///
    /// The first checkpoint recorded while no baseline exists becomes a baseline, and so
    /// does the first one carrying weights while only placeholder baselines exist.
    pub async fn create(&mut self, request: CheckpointRequest<'_>) -> LearningResult<String> {
        let id = self.next_id();
        let trained = has_weights(&request.weights);
        let is_baseline = request.mark_as_baseline
            || self.baseline_count() == 0
            || (trained && self.drift_baseline().is_none());
        let checkpoint = Checkpoint {
            header: CheckpointHeader {
                id: id.clone(),
                reason: request.reason.to_string(),
                created_at: Utc::now(),
                is_baseline,
                trajectory_ids: request.trajectory_ids,
            },
            weights: request.weights,
            route_stats: request.route_stats,
        };

        self.persist(&checkpoint).await?;
        self.checkpoints.push(checkpoint);
        tracing::info!(
            checkpoint = %id,
            reason = request.reason,
            baseline = is_baseline,
            "checkpoint created"
        );

        if is_baseline && trained {
            self.demote_placeholders().await?;
        }
        self.prune().await;
        Ok(id)
    }

    /// Turn every placeholder baseline into an ordinary checkpoint. Only called once a
    /// trained baseline exists.
    async fn demote_placeholders(&mut self) -> LearningResult<()> {
        for idx in 0..self.checkpoints.len() {
            let current = &self.checkpoints[idx];
            if !current.is_baseline() || current.is_trained() {
                continue;
            }
            let mut demoted = current.clone();
            demoted.header.is_baseline = false;
            self.persist(&demoted).await?;
            tracing::info!(checkpoint = %demoted.id(), "placeholder baseline demoted");
            self.checkpoints[idx] = demoted;
        }
        Ok(())
    }

    /// Drop the oldest non-baseline checkpoints until the ring fits. The newest
    /// checkpoint is never pruned.
    async fn prune(&mut self) {
        while self.checkpoints.len() > self.max_checkpoints {
            let newest = self.checkpoints.len() - 1;
            let Some(idx) = self.checkpoints[..newest]
                .iter()
                .position(|c| !c.is_baseline())
            else {
                tracing::warn!(
                    retained = self.checkpoints.len(),
                    limit = self.max_checkpoints,
                    "checkpoint ring over limit but only baselines remain"
                );
                break;
            };
            let removed = self.checkpoints.remove(idx);
            self.remove_file(removed.id()).await;
            tracing::debug!(checkpoint = %removed.id(), "pruned checkpoint");
        }
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.header.id == id)
    }

    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Most recent baseline.
    pub fn baseline(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.is_baseline())
    }

    /// Most recent trained baseline: the reference for drift. `None` while only
    /// placeholders exist.
    pub fn drift_baseline(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.is_baseline() && c.is_trained())
    }

    pub fn baseline_count(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.is_baseline()).count()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn list(&self) -> Vec<CheckpointSummary> {
        self.checkpoints.iter().map(Checkpoint::summary).collect()
    }

    pub async fn mark_baseline(&mut self, id: &str) -> LearningResult<()> {
        let idx = self.index_of(id)?;
        if self.checkpoints[idx].is_baseline() {
            return Ok(());
        }
        let mut updated = self.checkpoints[idx].clone();
        updated.header.is_baseline = true;
        self.persist(&updated).await?;
        let trained = updated.is_trained();
        self.checkpoints[idx] = updated;
        if trained {
            self.demote_placeholders().await?;
        }
        Ok(())
    }

    pub async fn unmark_baseline(&mut self, id: &str) -> LearningResult<()> {
        let idx = self.index_of(id)?;
        if !self.checkpoints[idx].is_baseline() {
            return Ok(());
        }
        if self.baseline_count() <= 1 {
            return Err(LearningError::Checkpoint(format!(
                "cannot unmark {id}: at least one baseline must remain"
            )));
        }
        let mut updated = self.checkpoints[idx].clone();
        updated.header.is_baseline = false;
        self.persist(&updated).await?;
        self.checkpoints[idx] = updated;
        Ok(())
    }

    pub async fn delete(&mut self, id: &str) -> LearningResult<()> {
        let idx = self.index_of(id)?;
        if self.checkpoints[idx].is_baseline() && self.baseline_count() <= 1 {
            return Err(LearningError::Checkpoint(format!(
                "cannot delete {id}: it is the last baseline"
            )));
        }
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LearningError::Checkpoint(format!(
                    "failed to delete {}: {e}",
                    path.display()
                )))
            }
        }
        self.checkpoints.remove(idx);
        Ok(())
    }

    /// Trajectories that back the last remaining baseline. Empty when several baselines
    /// exist, since no single trajectory is then the only support of a baseline. Trained
    /// baselines are counted on their own once there is one.
    pub fn protected_trajectory_ids(&self) -> HashSet<String> {
        let trained: Vec<&Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.is_baseline() && c.is_trained())
            .collect();
        let sole = match trained.as_slice() {
            [only] => Some(*only),
            [] if self.baseline_count() == 1 => self.baseline(),
            _ => None,
        };
        sole.map(|c| c.header.trajectory_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn index_of(&self, id: &str) -> LearningResult<usize> {
        self.checkpoints
            .iter()
            .position(|c| c.header.id == id)
            .ok_or_else(|| LearningError::Checkpoint(format!("checkpoint not found: {id}")))
    }

    /// `ckpt-{unix millis}-{seq}`; strictly increasing within this store.
    fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        if now > self.last_millis {
            self.last_millis = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("ckpt-{:013}-{:010}", self.last_millis, self.seq)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{CHECKPOINT_EXTENSION}"))
    }

    async fn persist(&self, checkpoint: &Checkpoint) -> LearningResult<()> {
        let path = self.path_for(checkpoint.id());
        let bytes = codec::encode(&checkpoint.to_file())
            .map_err(|e| LearningError::Checkpoint(e.to_string()))?;
        crate::storage::write_atomic(&path, &bytes)
            .await
            .map_err(|e| LearningError::Checkpoint(format!("failed to write {}: {e}", path.display())))
    }

    async fn remove_file(&self, id: &str) {
        let path = self.path_for(id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove pruned checkpoint");
            }
        }
    }
}

/// Numeric ordering key, so IDs of differing widths still sort by creation.
fn id_key(id: &str) -> (Option<(i64, u32)>, &str) {
    (parse_id(id), id)
}

fn has_weights(store: &WeightStore) -> bool {
    store.iter().any(|(_, _, entry)| entry.weight != 0.0)
}

fn parse_id(id: &str) -> Option<(i64, u32)> {
    let mut parts = id.strip_prefix("ckpt-")?.splitn(2, '-');
    let millis = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    Some((millis, seq))
}

type ScanEntry = (PathBuf, LearningResult<Checkpoint>);

async fn scan_dir(dir: &Path) -> LearningResult<Vec<ScanEntry>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LearningError::Checkpoint(format!(
                "failed to read {}: {e}",
                dir.display()
            )))
        }
    };

    let mut results = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                return Err(LearningError::Checkpoint(format!(
                    "failed to read {}: {e}",
                    dir.display()
                )))
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
            continue;
        }
        let result = match tokio::fs::read(&path).await {
            Ok(bytes) => codec::decode(&bytes).and_then(|file| {
                Checkpoint::from_file(file).ok_or_else(|| {
                    LearningError::Checkpoint("file has no checkpoint header".into())
                })
            }),
            Err(e) => Err(LearningError::Checkpoint(format!("read failed: {e}"))),
        };
        results.push((path, result));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(reason: &str, baseline: bool, weight: f32) -> CheckpointRequest<'_> {
        let mut weights = WeightStore::new();
        weights.set_weight("p1", "r", weight).unwrap();
        CheckpointRequest {
            reason,
            weights,
            route_stats: BTreeMap::new(),
            trajectory_ids: vec![format!("traj-{reason}")],
            mark_as_baseline: baseline,
        }
    }

    #[tokio::test]
    async fn first_checkpoint_becomes_baseline() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 10);
        let id = store.create(request("first", false, 0.1)).await.unwrap();
        assert!(store.get(&id).unwrap().is_baseline());

        let second = store.create(request("second", false, 0.2)).await.unwrap();
        assert!(!store.get(&second).unwrap().is_baseline());
        assert!(second > id);
    }

    #[tokio::test]
    async fn ring_prunes_oldest_non_baseline() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 3);
        let baseline = store.create(request("base", true, 0.05)).await.unwrap();
        let a = store.create(request("a", false, 0.1)).await.unwrap();
        let b = store.create(request("b", false, 0.2)).await.unwrap();
        let c = store.create(request("c", false, 0.3)).await.unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get(&baseline).is_some());
        assert!(store.get(&a).is_none());
        assert!(store.get(&b).is_some());
        assert!(store.get(&c).is_some());
        assert!(!tmp.path().join(format!("{a}.ckpt")).exists());
    }

    #[tokio::test]
    async fn last_baseline_cannot_be_unmarked_or_deleted() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 10);
        let base = store.create(request("base", true, 0.3)).await.unwrap();
        let other = store.create(request("other", false, 0.5)).await.unwrap();

        assert!(store.unmark_baseline(&base).await.is_err());
        assert!(store.delete(&base).await.is_err());

        store.mark_baseline(&other).await.unwrap();
        store.unmark_baseline(&base).await.unwrap();
        assert_eq!(store.baseline_count(), 1);
        assert_eq!(store.baseline().unwrap().id(), other);
    }

    #[tokio::test]
    async fn load_all_restores_and_skips_corrupt_files() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let mut store = CheckpointStore::new(tmp.path(), 10);
            store.create(request("persisted", true, 0.4)).await.unwrap()
        };
        std::fs::write(tmp.path().join("ckpt-0000000000001-0000.ckpt"), b"garbage").unwrap();

        let mut store = CheckpointStore::load_all(tmp.path(), 10).await.unwrap();
        assert_eq!(store.len(), 1);
        let loaded = store.get(&id).unwrap();
        assert!(loaded.is_baseline());
        assert_eq!(loaded.weights.get_weight("p1", "r"), 0.4);

        let next = store.create(request("after", false, 0.0)).await.unwrap();
        assert!(next > id);
    }

    #[tokio::test]
    async fn protected_ids_only_for_sole_baseline() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 10);
        let base = store.create(request("base", true, 0.1)).await.unwrap();
        assert!(store.protected_trajectory_ids().contains("traj-base"));

        let second = store.create(request("second", true, 0.2)).await.unwrap();
        assert!(store.protected_trajectory_ids().is_empty());

        store.unmark_baseline(&base).await.unwrap();
        assert_eq!(store.baseline().unwrap().id(), second);
        assert!(store.protected_trajectory_ids().contains("traj-second"));
    }

    #[tokio::test]
    async fn placeholder_baseline_gives_way_to_trained_weights() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 10);
        let placeholder = store
            .create(CheckpointRequest {
                reason: "initial",
                weights: WeightStore::new(),
                route_stats: BTreeMap::new(),
                trajectory_ids: Vec::new(),
                mark_as_baseline: true,
            })
            .await
            .unwrap();
        assert!(store.drift_baseline().is_none());

        // not asked to be a baseline, but the first one with weights becomes one
        let trained = store.create(request("trained", false, 0.4)).await.unwrap();
        assert!(store.get(&trained).unwrap().is_baseline());
        assert!(!store.get(&placeholder).unwrap().is_baseline());
        assert_eq!(store.baseline_count(), 1);
        assert_eq!(store.drift_baseline().unwrap().id(), trained);
        assert!(store.protected_trajectory_ids().contains("traj-trained"));

        let reloaded = CheckpointStore::load_all(tmp.path(), 10).await.unwrap();
        assert!(!reloaded.get(&placeholder).unwrap().is_baseline());
    }

    #[tokio::test]
    async fn ids_sort_by_creation_past_four_digit_sequences() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), 10);
        store.last_millis = i64::MAX;
        store.seq = 9_998;
        let earlier = store.next_id();
        let later = store.next_id();
        assert!(earlier.ends_with("0000009999"));
        assert!(later > earlier);
        assert!(id_key(&later) > id_key(&earlier));
        assert!(id_key("ckpt-0000000000005-10000") > id_key("ckpt-0000000000005-9999"));
    }
}
