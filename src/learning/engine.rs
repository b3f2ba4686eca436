//! The learning engine: the one handle a host process opens and shares.
//!
//! Locks are always taken in the order `update_lock → safety → state`. `state` is a
//! parking_lot mutex and is never held across an await; the two tokio mutexes may be.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::checkpoint::{CheckpointRequest, CheckpointSummary};
use super::codec::{self, WeightFile, WeightFileMetadata};
use super::drift::{DriftGuard, DriftMetrics, DriftStatus};
use super::pattern::{self, NoopPatternSink, PatternSink};
use super::rollback::{RestorePlan, RollbackController};
use super::types::{
    validate_identifier, FeedbackOptions, LearningStats, Pattern, RollbackOutcome, Trajectory,
    WeightUpdateResult,
};
use super::update::{self, FeedbackInput, RouteStats, UpdateParams};
use super::weights::WeightStore;
use crate::config::StrataConfig;
use crate::error::{LearningError, LearningResult};
use crate::learning::checkpoint::CheckpointStore;
use crate::storage::stream::FlushTimer;
use crate::storage::{
    BaselineRegistry, DeleteOutcome, MemoryProbe, ProcMemoryProbe, PruneReport, StreamDeps,
    TrajectoryFilter, TrajectoryStreamManager,
};
use crate::telemetry::{OpTimer, Telemetry, TracingTelemetry};

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct EngineDeps {
    pub telemetry: Arc<dyn Telemetry>,
    pub pattern_sink: Arc<dyn PatternSink>,
    /// `None` reads `/proc` against the configured memory budget.
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            telemetry: Arc::new(TracingTelemetry),
            pattern_sink: Arc::new(NoopPatternSink),
            memory_probe: None,
        }
    }
}

struct EngineState {
    weights: WeightStore,
    route_stats: BTreeMap<String, RouteStats>,
    /// Keyed by pattern ID; v7 UUIDs keep this in creation order.
    patterns: BTreeMap<String, Pattern>,
    pattern_by_trajectory: HashMap<String, String>,
    /// Trajectories recorded since the last checkpoint.
    recorded_since_checkpoint: Vec<String>,
    dirty: bool,
    last_saved: Instant,
    last_drift: Option<DriftMetrics>,
}

/// A drift measurement and the rollback it may have triggered.
struct DriftCheck {
    metrics: DriftMetrics,
    rollback: Option<RollbackOutcome>,
}

pub struct LearningEngine {
    config: StrataConfig,
    params: UpdateParams,
    drift_guard: DriftGuard,
    update_lock: tokio::sync::Mutex<()>,
    save_lock: tokio::sync::Mutex<()>,
    safety: tokio::sync::Mutex<RollbackController>,
    state: parking_lot::Mutex<EngineState>,
    stream: Arc<TrajectoryStreamManager>,
    baselines: Arc<BaselineRegistry>,
    telemetry: Arc<dyn Telemetry>,
    pattern_sink: Arc<dyn PatternSink>,
    weights_path: PathBuf,
    patterns_path: PathBuf,
    _flush_timer: FlushTimer,
}

impl LearningEngine {
    /// Open the engine over `config`'s data directory.
    ///
    /// An unreadable weight or pattern file is logged and replaced by an empty state;
    /// corrupted checkpoint files are skipped. With `checkpoint_on_start`, an initial
    /// baseline checkpoint is created when none exists.
    pub async fn open(config: StrataConfig, deps: EngineDeps) -> LearningResult<Self> {
        let data_dir = config.resolved_data_dir();
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            LearningError::WeightPersistence(format!("failed to create {}: {e}", data_dir.display()))
        })?;

        let weights_path = config.weights_path();
        let (weights, route_stats) = match codec::load(&weights_path).await {
            Ok(Some(file)) => (file.store, file.metadata.route_stats),
            Ok(None) => (WeightStore::new(), BTreeMap::new()),
            Err(e) => {
                tracing::warn!(path = %weights_path.display(), error = %e, "weight file unreadable; starting empty");
                (WeightStore::new(), BTreeMap::new())
            }
        };
        let patterns_path = config.patterns_path();
        let patterns = load_patterns(&patterns_path).await;

        let checkpoints =
            CheckpointStore::load_all(config.checkpoints_dir(), config.safety.max_checkpoints).await?;
        let baselines = Arc::new(BaselineRegistry::default());
        baselines.replace(checkpoints.protected_trajectory_ids());

        let memory_probe: Arc<dyn MemoryProbe> = match deps.memory_probe {
            Some(probe) => probe,
            None => Arc::new(ProcMemoryProbe::new(config.stream.memory_budget_mb)),
        };
        let stream = Arc::new(
            TrajectoryStreamManager::open(
                config.trajectories_dir(),
                config.stream.clone(),
                StreamDeps {
                    memory_probe,
                    baseline_guard: baselines.clone(),
                    telemetry: deps.telemetry.clone(),
                },
            )
            .await?,
        );

        let mut safety = RollbackController::new(checkpoints, &config.safety);
        if config.safety.checkpoint_on_start && safety.checkpoints().baseline_count() == 0 {
            safety
                .create_checkpoint(CheckpointRequest {
                    reason: "initial",
                    weights: weights.clone(),
                    route_stats: route_stats.clone(),
                    trajectory_ids: Vec::new(),
                    mark_as_baseline: true,
                })
                .await?;
            baselines.replace(safety.checkpoints().protected_trajectory_ids());
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            routes = weights.route_count(),
            weights = weights.len(),
            patterns = patterns.len(),
            checkpoints = safety.checkpoints().len(),
            "learning engine opened"
        );

        let pattern_by_trajectory = patterns
            .values()
            .map(|p| (p.source_trajectory.clone(), p.id.clone()))
            .collect();
        let flush_timer = stream.start_flush_timer();

        Ok(Self {
            params: UpdateParams::from(&config.learning),
            drift_guard: DriftGuard::from(&config.safety),
            update_lock: tokio::sync::Mutex::new(()),
            save_lock: tokio::sync::Mutex::new(()),
            safety: tokio::sync::Mutex::new(safety),
            state: parking_lot::Mutex::new(EngineState {
                weights,
                route_stats,
                patterns,
                pattern_by_trajectory,
                recorded_since_checkpoint: Vec::new(),
                dirty: false,
                last_saved: Instant::now(),
                last_drift: None,
            }),
            stream,
            baselines,
            telemetry: deps.telemetry,
            pattern_sink: deps.pattern_sink,
            weights_path,
            patterns_path,
            _flush_timer: flush_timer,
            config,
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn stream(&self) -> &Arc<TrajectoryStreamManager> {
        &self.stream
    }

    // --- trajectories ---

    pub async fn create_trajectory(
        &self,
        route: &str,
        pattern_ids: Vec<String>,
        context_ids: Vec<String>,
    ) -> LearningResult<String> {
        let timer = OpTimer::start("engine", "create_trajectory");
        let result = self.create_trajectory_inner(route, pattern_ids, context_ids).await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    async fn create_trajectory_inner(
        &self,
        route: &str,
        pattern_ids: Vec<String>,
        context_ids: Vec<String>,
    ) -> LearningResult<String> {
        let trajectory = Trajectory::new(route, pattern_ids, context_ids);
        trajectory
            .validate()
            .map_err(LearningError::TrajectoryValidation)?;
        let id = trajectory.id.clone();
        self.stream.add_trajectory(trajectory).await?;

        self.safety.lock().await.record_trajectory();
        self.state.lock().recorded_since_checkpoint.push(id.clone());
        tracing::debug!(trajectory = %id, route, "trajectory created");
        Ok(id)
    }

    /// Append a pattern to a trajectory that has not received feedback yet.
    pub async fn add_pattern_to_trajectory(&self, trajectory_id: &str, pattern_id: &str) -> LearningResult<()> {
        validate_identifier("pattern id", pattern_id).map_err(LearningError::TrajectoryValidation)?;
        let _update = self.update_lock.lock().await;

        let mut trajectory = self.load_trajectory(trajectory_id).await?;
        if trajectory.processed {
            return Err(LearningError::TrajectoryValidation(format!(
                "trajectory {trajectory_id} already received feedback"
            )));
        }
        if trajectory.pattern_ids.iter().any(|p| p == pattern_id) {
            return Err(LearningError::TrajectoryValidation(format!(
                "pattern {pattern_id} is already part of {trajectory_id}"
            )));
        }
        trajectory.pattern_ids.push(pattern_id.to_string());
        trajectory
            .validate()
            .map_err(LearningError::TrajectoryValidation)?;
        self.stream.update_trajectory(trajectory).await?;
        Ok(())
    }

    pub async fn get_trajectory(&self, trajectory_id: &str) -> LearningResult<Option<Trajectory>> {
        Ok(self.stream.get_trajectory(trajectory_id).await?)
    }

    async fn load_trajectory(&self, trajectory_id: &str) -> LearningResult<Trajectory> {
        self.stream
            .get_trajectory(trajectory_id)
            .await?
            .ok_or_else(|| LearningError::TrajectoryNotFound(trajectory_id.to_string()))
    }

    pub async fn delete_trajectory(&self, trajectory_id: &str, force: bool) -> LearningResult<DeleteOutcome> {
        Ok(self.stream.delete_trajectory(trajectory_id, force).await?)
    }

    pub async fn prune_trajectories(
        &self,
        filter: &TrajectoryFilter,
        limit: Option<usize>,
    ) -> LearningResult<PruneReport> {
        Ok(self.stream.prune_trajectories(filter, limit).await?)
    }

    // --- weights ---

    /// Absent entries read as 0.0.
    pub fn get_weight(&self, pattern_id: &str, route: &str) -> f32 {
        self.state.lock().weights.get_weight(pattern_id, route)
    }

    pub fn get_weights(&self, route: &str) -> Vec<(String, f32)> {
        self.state.lock().weights.get_weights(route)
    }

    /// Score a trajectory and run the EWC-damped update over its patterns.
    ///
    /// Everything from the success-rate lookup to the drift check runs under the update
    /// lock. The throttled save happens after the lock is released and never fails the call.
    pub async fn provide_feedback(
        &self,
        trajectory_id: &str,
        quality: f64,
        options: FeedbackOptions,
    ) -> LearningResult<WeightUpdateResult> {
        let timer = OpTimer::start("engine", "provide_feedback");
        let result = self.feedback_inner(trajectory_id, quality, &options).await;
        timer.finish(&*self.telemetry, &result);

        if result.is_ok() && !options.skip_auto_save {
            self.maybe_auto_save().await;
        }
        result
    }

    async fn feedback_inner(
        &self,
        trajectory_id: &str,
        quality: f64,
        options: &FeedbackOptions,
    ) -> LearningResult<WeightUpdateResult> {
        validate_feedback(quality, options)?;
        let learning = &self.config.learning;

        let _update = self.update_lock.lock().await;
        let mut trajectory = self.load_trajectory(trajectory_id).await?;
        let mut safety = self.safety.lock().await;

        let (reward, weights_updated, minted) = {
            let mut state = self.state.lock();
            let success_rate = update::success_rate(
                state.route_stats.get(&trajectory.route),
                learning.default_success_rate,
            );
            let input = FeedbackInput {
                route: &trajectory.route,
                pattern_ids: &trajectory.pattern_ids,
                quality,
                l_score: options.l_score.unwrap_or(1.0),
                success_rate,
                similarities: &options.similarities,
            };
            let (reward, updates) = update::plan_updates(&state.weights, &input, &self.params)?;
            update::commit_updates(&mut state.weights, &trajectory.route, &updates)?;
            state
                .route_stats
                .entry(trajectory.route.clone())
                .or_default()
                .record(quality, learning.success_rate_decay);
            state.dirty = true;

            let minted = if quality >= learning.pattern_quality_threshold
                && !state.pattern_by_trajectory.contains_key(&trajectory.id)
            {
                let pattern = pattern::synthesize(&trajectory, quality, options.rlm_context.as_ref());
                state
                    .pattern_by_trajectory
                    .insert(trajectory.id.clone(), pattern.id.clone());
                state.patterns.insert(pattern.id.clone(), pattern.clone());
                Some(pattern)
            } else {
                None
            };

            tracing::debug!(
                trajectory = %trajectory.id,
                route = %trajectory.route,
                reward,
                success_rate,
                updated = updates.len(),
                "weights updated"
            );
            (reward, updates.len(), minted)
        };

        trajectory.quality = Some(quality);
        trajectory.processed = true;
        self.stream.update_trajectory(trajectory).await?;
        if weights_updated > 0 {
            safety.observe_weights_moved();
        }

        let drift = self.drift_step(&mut safety, self.config.safety.auto_rollback)?;
        drop(safety);

        if let Some(pattern) = &minted {
            if let Err(e) = self.pattern_sink.pattern_created(pattern) {
                tracing::warn!(pattern = %pattern.id, error = %e, "pattern sink failed");
            }
        }

        let (drift, rolled_back) = match drift {
            Some(check) => (Some(check.metrics), check.rollback.is_some()),
            None => (None, false),
        };
        Ok(WeightUpdateResult {
            trajectory_id: trajectory_id.to_string(),
            weights_updated,
            reward,
            pattern_created: minted.is_some(),
            pattern_id: minted.map(|p| p.id),
            drift,
            rolled_back,
        })
    }

    // --- drift & rollback ---

    /// Measure drift against the most recent baseline that carries weights. With
    /// `auto_rollback`, a critical drift restores that baseline.
    pub async fn check_drift(&self, auto_rollback: bool) -> LearningResult<DriftMetrics> {
        let check = {
            let _update = self.update_lock.lock().await;
            let mut safety = self.safety.lock().await;
            self.drift_step(&mut safety, auto_rollback)?
        };
        let check = check.ok_or_else(|| {
            LearningError::Checkpoint("no trained baseline checkpoint to measure drift against".into())
        })?;
        if check.rollback.is_some() {
            self.save_weights().await?;
        }
        Ok(check.metrics)
    }

    /// Runs with `safety` locked. `None` when no baseline carries weights yet.
    fn drift_step(
        &self,
        safety: &mut RollbackController,
        auto_rollback: bool,
    ) -> LearningResult<Option<DriftCheck>> {
        let metrics = {
            let Some(baseline) = safety.drift_baseline() else {
                return Ok(None);
            };
            let state = self.state.lock();
            self.drift_guard
                .check(&state.weights, &baseline.weights, baseline.id())
        };
        safety.observe_drift(&metrics);
        self.state.lock().last_drift = Some(metrics.clone());

        match metrics.status {
            DriftStatus::Ok => {}
            DriftStatus::Warning => {
                tracing::warn!(drift = metrics.drift, baseline = %metrics.baseline_id, "weight drift above alert threshold");
            }
            DriftStatus::Critical if !auto_rollback => {
                tracing::warn!(
                    drift = metrics.drift,
                    baseline = %metrics.baseline_id,
                    "critical weight drift; automatic rollback disabled"
                );
            }
            DriftStatus::Critical => {
                return match safety.begin_rollback(Some(&metrics.baseline_id)) {
                    Ok(plan) => {
                        let rollback = self.apply_restore(plan);
                        Ok(Some(DriftCheck {
                            metrics,
                            rollback: Some(rollback),
                        }))
                    }
                    Err(LearningError::RollbackLoop(reason)) => {
                        tracing::error!(drift = metrics.drift, %reason, "critical drift but rollback refused");
                        Err(LearningError::DriftExceeded {
                            drift: metrics.drift,
                            threshold: self.drift_guard.reject_threshold,
                        })
                    }
                    Err(e) => Err(e),
                };
            }
        }
        Ok(Some(DriftCheck {
            metrics,
            rollback: None,
        }))
    }

    fn apply_restore(&self, plan: RestorePlan) -> RollbackOutcome {
        let mut state = self.state.lock();
        state.weights = plan.weights;
        state.route_stats = plan.route_stats;
        state.dirty = true;
        RollbackOutcome {
            checkpoint_id: plan.checkpoint_id,
            restored_entries: state.weights.len(),
            rollback_count: plan.rollback_count,
        }
    }

    /// Restore a checkpoint (the most recent one when `checkpoint_id` is `None`) and
    /// persist the restored weights.
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: Option<&str>) -> LearningResult<RollbackOutcome> {
        let timer = OpTimer::start("engine", "rollback");
        let result: LearningResult<RollbackOutcome> = async {
            let outcome = {
                let _update = self.update_lock.lock().await;
                let mut safety = self.safety.lock().await;
                let plan = safety.begin_rollback(checkpoint_id)?;
                self.apply_restore(plan)
            };
            self.save_weights().await?;
            Ok(outcome)
        }
        .await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    // --- checkpoints ---

    pub async fn create_checkpoint(&self, reason: &str, mark_as_baseline: bool) -> LearningResult<String> {
        let timer = OpTimer::start("engine", "create_checkpoint");
        let result: LearningResult<String> = async {
            let _update = self.update_lock.lock().await;
            let mut safety = self.safety.lock().await;
            let (weights, route_stats, trajectory_ids) = {
                let state = self.state.lock();
                (
                    state.weights.clone(),
                    state.route_stats.clone(),
                    state.recorded_since_checkpoint.clone(),
                )
            };
            let recorded = trajectory_ids.len();
            let id = safety
                .create_checkpoint(CheckpointRequest {
                    reason,
                    weights,
                    route_stats,
                    trajectory_ids,
                    mark_as_baseline,
                })
                .await?;
            self.state.lock().recorded_since_checkpoint.drain(..recorded);
            self.refresh_baselines(&safety);
            Ok(id)
        }
        .await;
        timer.finish(&*self.telemetry, &result);
        result
    }

    pub async fn list_checkpoints(&self) -> Vec<CheckpointSummary> {
        self.safety.lock().await.list_checkpoints()
    }

    pub async fn mark_baseline(&self, checkpoint_id: &str) -> LearningResult<()> {
        let mut safety = self.safety.lock().await;
        safety.mark_baseline(checkpoint_id).await?;
        self.refresh_baselines(&safety);
        Ok(())
    }

    /// Fails when `checkpoint_id` is the last baseline.
    pub async fn unmark_baseline(&self, checkpoint_id: &str) -> LearningResult<()> {
        let mut safety = self.safety.lock().await;
        safety.unmark_baseline(checkpoint_id).await?;
        self.refresh_baselines(&safety);
        Ok(())
    }

    /// Fails when `checkpoint_id` is the last baseline.
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> LearningResult<()> {
        let mut safety = self.safety.lock().await;
        safety.delete_checkpoint(checkpoint_id).await?;
        self.refresh_baselines(&safety);
        Ok(())
    }

    fn refresh_baselines(&self, safety: &RollbackController) {
        self.baselines
            .replace(safety.checkpoints().protected_trajectory_ids());
    }

    // --- patterns ---

    pub fn get_pattern(&self, pattern_id: &str) -> Option<Pattern> {
        self.state.lock().patterns.get(pattern_id).cloned()
    }

    /// Oldest first, optionally restricted to one route.
    pub fn list_patterns(&self, route: Option<&str>) -> Vec<Pattern> {
        self.state
            .lock()
            .patterns
            .values()
            .filter(|p| route.map_or(true, |r| p.route == r))
            .cloned()
            .collect()
    }

    /// Increment a pattern's usage count. Returns the new count, or `None` if unknown.
    pub fn record_pattern_usage(&self, pattern_id: &str) -> Option<u64> {
        let mut state = self.state.lock();
        let pattern = state.patterns.get_mut(pattern_id)?;
        pattern.usage_count += 1;
        let count = pattern.usage_count;
        state.dirty = true;
        Some(count)
    }

    // --- persistence & stats ---

    /// Write the weight file and the pattern file now.
    pub async fn save_weights(&self) -> LearningResult<()> {
        let _save = self.save_lock.lock().await;
        let (file, patterns) = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.last_saved = Instant::now();
            (
                WeightFile {
                    metadata: WeightFileMetadata::now(state.route_stats.clone()),
                    store: state.weights.clone(),
                },
                state.patterns.values().cloned().collect::<Vec<_>>(),
            )
        };

        let result = async {
            codec::save(&self.weights_path, &file).await?;
            save_patterns(&self.patterns_path, &patterns).await
        }
        .await;
        match &result {
            Ok(()) => tracing::debug!(
                path = %self.weights_path.display(),
                weights = file.store.len(),
                patterns = patterns.len(),
                "weights saved"
            ),
            Err(_) => self.state.lock().dirty = true,
        }
        result
    }

    async fn maybe_auto_save(&self) {
        let due = {
            let state = self.state.lock();
            state.dirty && state.last_saved.elapsed() >= self.config.learning.auto_save_interval()
        };
        if due {
            if let Err(e) = self.save_weights().await {
                tracing::warn!(error = %e, "auto-save failed; will retry on the next update");
            }
        }
    }

    pub async fn get_stats(&self) -> LearningStats {
        let stream = self.stream.stats().await;
        let safety = self.safety.lock().await;
        let state = self.state.lock();
        LearningStats {
            routes: state.weights.route_count(),
            weights: state.weights.len(),
            mean_fisher: state.weights.mean_fisher(),
            patterns: state.patterns.len(),
            trajectories_hot: stream.hot,
            trajectories_pending: stream.pending,
            trajectories_on_disk: stream.on_disk,
            checkpoints: safety.checkpoints().len(),
            baselines: safety.checkpoints().baseline_count(),
            rollback_count: safety.state().rollback_count,
            safety_state: safety.safety_state(),
            last_drift: state.last_drift.clone(),
        }
    }

    /// Flush every unsaved trajectory and save weights.
    pub async fn close(&self) -> LearningResult<()> {
        self.stream.close().await?;
        self.save_weights().await?;
        tracing::info!("learning engine closed");
        Ok(())
    }
}

fn validate_feedback(quality: f64, options: &FeedbackOptions) -> LearningResult<()> {
    if !quality.is_finite() || !(0.0..=1.0).contains(&quality) {
        return Err(LearningError::FeedbackValidation(format!(
            "quality must be within [0, 1], got {quality}"
        )));
    }
    if let Some(l_score) = options.l_score {
        if !l_score.is_finite() || !(0.0..=1.0).contains(&l_score) {
            return Err(LearningError::FeedbackValidation(format!(
                "l_score must be within [0, 1], got {l_score}"
            )));
        }
    }
    for (pattern_id, similarity) in &options.similarities {
        if !similarity.is_finite() || !(-1.0..=1.0).contains(similarity) {
            return Err(LearningError::FeedbackValidation(format!(
                "similarity for {pattern_id} must be within [-1, 1], got {similarity}"
            )));
        }
    }
    Ok(())
}

async fn load_patterns(path: &std::path::Path) -> BTreeMap<String, Pattern> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "pattern file unreadable; starting empty");
            return BTreeMap::new();
        }
    };
    match serde_json::from_slice::<Vec<Pattern>>(&bytes) {
        Ok(patterns) => patterns.into_iter().map(|p| (p.id.clone(), p)).collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "pattern file corrupted; starting empty");
            BTreeMap::new()
        }
    }
}

async fn save_patterns(path: &std::path::Path, patterns: &[Pattern]) -> LearningResult<()> {
    let json = serde_json::to_vec(patterns)
        .map_err(|e| LearningError::WeightPersistence(format!("failed to encode patterns: {e}")))?;
    crate::storage::write_atomic(path, &json)
        .await
        .map_err(|e| LearningError::WeightPersistence(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::drift::SafetyState;
    use tempfile::TempDir;

    async fn engine(tmp: &TempDir) -> LearningEngine {
        let config = StrataConfig::with_data_dir(tmp.path());
        LearningEngine::open(config, EngineDeps::default()).await.unwrap()
    }

    #[tokio::test]
    async fn open_creates_initial_baseline() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let checkpoints = engine.list_checkpoints().await;
        assert_eq!(checkpoints.len(), 1);
        assert!(checkpoints[0].is_baseline);
        assert_eq!(engine.get_stats().await.safety_state, SafetyState::Stable);
    }

    #[tokio::test]
    async fn feedback_validation_rejects_out_of_range_inputs() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let id = engine
            .create_trajectory("r", vec!["p".into()], vec![])
            .await
            .unwrap();

        for quality in [-0.1, 1.1, f64::NAN] {
            let err = engine
                .provide_feedback(&id, quality, FeedbackOptions::default())
                .await
                .unwrap_err();
            assert!(err.is_validation(), "{quality}: {err}");
        }
        let err = engine
            .provide_feedback(&id, 0.5, FeedbackOptions::default().with_l_score(2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::FeedbackValidation(_)));
        assert_eq!(engine.get_weight("p", "r"), 0.0);
    }

    #[tokio::test]
    async fn unknown_trajectory_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let err = engine
            .provide_feedback("traj-missing", 0.5, FeedbackOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::TrajectoryNotFound(_)));
    }

    #[tokio::test]
    async fn patterns_are_minted_once_per_trajectory() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let id = engine
            .create_trajectory("r", vec!["p1".into(), "p2".into()], vec![])
            .await
            .unwrap();

        let first = engine
            .provide_feedback(&id, 0.9, FeedbackOptions::default())
            .await
            .unwrap();
        assert!(first.pattern_created);
        let second = engine
            .provide_feedback(&id, 0.95, FeedbackOptions::default())
            .await
            .unwrap();
        assert!(!second.pattern_created);

        let pattern_id = first.pattern_id.unwrap();
        assert_eq!(engine.list_patterns(Some("r")).len(), 1);
        assert!(engine.list_patterns(Some("other")).is_empty());
        assert_eq!(engine.record_pattern_usage(&pattern_id), Some(1));
        assert_eq!(engine.get_pattern(&pattern_id).unwrap().usage_count, 1);
        assert_eq!(engine.record_pattern_usage("pat-unknown"), None);
    }

    #[tokio::test]
    async fn patterns_cannot_be_added_after_feedback() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let id = engine.create_trajectory("r", vec!["p1".into()], vec![]).await.unwrap();

        engine.add_pattern_to_trajectory(&id, "p2").await.unwrap();
        assert!(engine.add_pattern_to_trajectory(&id, "p2").await.is_err());
        assert!(engine.add_pattern_to_trajectory(&id, " ").await.is_err());

        let result = engine
            .provide_feedback(&id, 0.6, FeedbackOptions::default())
            .await
            .unwrap();
        assert_eq!(result.weights_updated, 2);
        let err = engine.add_pattern_to_trajectory(&id, "p3").await.unwrap_err();
        assert!(matches!(err, LearningError::TrajectoryValidation(_)));
    }
}
