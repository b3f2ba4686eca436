//! Rollback control: the single owner of checkpoints and rollback history.
//!
//! Two guards keep automatic rollbacks from looping:
//!
//! 1. Rate limit: at most `max_rollbacks_per_window` rollbacks inside the trailing window.
//! 2. Progress: rolling back to the same checkpoint as last time requires a new trajectory
//!    or checkpoint to have been recorded since.
//!
//! The controller also drives the `stable → drifting → rolled_back → stable` state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::checkpoint::{Checkpoint, CheckpointRequest, CheckpointStore, CheckpointSummary};
use super::drift::{DriftMetrics, DriftStatus, SafetyState};
use super::update::RouteStats;
use super::weights::WeightStore;
use crate::config::SafetyConfig;
use crate::error::{LearningError, LearningResult};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackState {
    pub rollback_count: u64,
    pub last_rollback_at: Option<DateTime<Utc>>,
    pub last_rollback_checkpoint_id: Option<String>,
    /// Set whenever a trajectory or checkpoint is recorded after the last rollback.
    pub progressed: bool,
    pub trajectories_since_rollback: u64,
    pub checkpoints_since_rollback: u64,
    #[serde(skip)]
    recent: VecDeque<Instant>,
}

/// What a rollback restores. The caller swaps these into the live engine state.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub checkpoint_id: String,
    pub weights: WeightStore,
    pub route_stats: BTreeMap<String, RouteStats>,
    pub rollback_count: u64,
}

pub struct RollbackController {
    checkpoints: CheckpointStore,
    state: RollbackState,
    safety: SafetyState,
    max_rollbacks_per_window: usize,
    window: Duration,
}

impl RollbackController {
    pub fn new(checkpoints: CheckpointStore, config: &SafetyConfig) -> Self {
        Self {
            checkpoints,
            state: RollbackState {
                progressed: true,
                ..Default::default()
            },
            safety: SafetyState::Stable,
            max_rollbacks_per_window: config.max_rollbacks_per_window.max(1),
            window: config.rollback_window(),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn state(&self) -> &RollbackState {
        &self.state
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointSummary> {
        self.checkpoints.list()
    }

    /// The baseline drift is measured against.
    pub fn drift_baseline(&self) -> Option<&Checkpoint> {
        self.checkpoints.drift_baseline()
    }

    pub fn record_trajectory(&mut self) {
        self.state.progressed = true;
        self.state.trajectories_since_rollback += 1;
    }

    pub async fn create_checkpoint(&mut self, request: CheckpointRequest<'_>) -> LearningResult<String> {
        let id = self.checkpoints.create(request).await?;
        self.state.progressed = true;
        self.state.checkpoints_since_rollback += 1;
        Ok(id)
    }

    pub async fn mark_baseline(&mut self, id: &str) -> LearningResult<()> {
        self.checkpoints.mark_baseline(id).await
    }

    pub async fn unmark_baseline(&mut self, id: &str) -> LearningResult<()> {
        self.checkpoints.unmark_baseline(id).await
    }

    pub async fn delete_checkpoint(&mut self, id: &str) -> LearningResult<()> {
        self.checkpoints.delete(id).await
    }

    /// Validate both loop guards, then record the rollback and hand back the snapshot.
    ///
    /// `checkpoint_id = None` targets the most recent checkpoint.
    pub fn begin_rollback(&mut self, checkpoint_id: Option<&str>) -> LearningResult<RestorePlan> {
        let target = match checkpoint_id {
            Some(id) => self
                .checkpoints
                .get(id)
                .ok_or_else(|| LearningError::Checkpoint(format!("checkpoint not found: {id}")))?,
            None => self
                .checkpoints
                .latest()
                .ok_or_else(|| LearningError::Checkpoint("no checkpoints to roll back to".into()))?,
        };

        let now = Instant::now();
        while let Some(&oldest) = self.state.recent.front() {
            if now.duration_since(oldest) > self.window {
                self.state.recent.pop_front();
            } else {
                break;
            }
        }
        if self.state.recent.len() >= self.max_rollbacks_per_window {
            return Err(LearningError::RollbackLoop(format!(
                "{} rollbacks within the last {}s (limit {})",
                self.state.recent.len(),
                self.window.as_secs(),
                self.max_rollbacks_per_window
            )));
        }

        if self.state.last_rollback_checkpoint_id.as_deref() == Some(target.id())
            && !self.state.progressed
        {
            return Err(LearningError::RollbackLoop(format!(
                "already rolled back to {} with no progress since",
                target.id()
            )));
        }

        let plan = RestorePlan {
            checkpoint_id: target.id().to_string(),
            weights: target.weights.clone(),
            route_stats: target.route_stats.clone(),
            rollback_count: self.state.rollback_count + 1,
        };

        self.state.recent.push_back(now);
        self.state.rollback_count += 1;
        self.state.last_rollback_at = Some(Utc::now());
        self.state.last_rollback_checkpoint_id = Some(plan.checkpoint_id.clone());
        self.state.progressed = false;
        self.state.trajectories_since_rollback = 0;
        self.state.checkpoints_since_rollback = 0;
        self.safety = SafetyState::RolledBack;

        tracing::warn!(
            checkpoint = %plan.checkpoint_id,
            rollback_count = plan.rollback_count,
            "rolled back to checkpoint"
        );
        Ok(plan)
    }

    /// Feed a drift measurement into the state machine.
    pub fn observe_drift(&mut self, metrics: &DriftMetrics) {
        let next = match (self.safety, metrics.status) {
            (SafetyState::RolledBack, DriftStatus::Ok) => SafetyState::RolledBack,
            (_, DriftStatus::Ok) => SafetyState::Stable,
            (_, DriftStatus::Warning | DriftStatus::Critical) => SafetyState::Drifting,
        };
        if next != self.safety {
            tracing::info!(from = %self.safety, to = %next, drift = metrics.drift, "safety state changed");
        }
        self.safety = next;
    }

    /// Called when feedback moved weights. Leaves `rolled_back` once progress was made.
    pub fn observe_weights_moved(&mut self) {
        if self.safety == SafetyState::RolledBack && self.state.progressed {
            tracing::info!("learning resumed after rollback");
            self.safety = SafetyState::Stable;
        }
    }
}
