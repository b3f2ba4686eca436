//! Core learning type definitions.
//!
//! Defines [`Trajectory`] (one recorded execution attempt), [`Pattern`] (a reusable
//! template minted from a high-quality trajectory), the feedback inputs and the result
//! and statistics types returned by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::drift::{DriftMetrics, SafetyState};

/// Upper bound on the length of a route or pattern identifier.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// One recorded execution attempt: the route it ran under, the patterns it used, and
/// eventually the quality score supplied through feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Time-ordered unique ID: `traj-{millis}-{rand}`.
    pub id: String,
    /// Task-type key the pattern weights are grouped under.
    pub route: String,
    pub pattern_ids: Vec<String>,
    pub context_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Quality score in `[0.0, 1.0]`, set by feedback.
    pub quality: Option<f64>,
    /// `true` once feedback has been applied.
    pub processed: bool,
}

impl Trajectory {
    /// Build a new, unscored trajectory with a fresh ID.
    pub fn new(route: &str, pattern_ids: Vec<String>, context_ids: Vec<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: generate_trajectory_id(created_at),
            route: route.to_string(),
            pattern_ids,
            context_ids,
            created_at,
            quality: None,
            processed: false,
        }
    }

    /// Check the fields a caller controls.
    pub fn validate(&self) -> Result<(), String> {
        validate_identifier("route", &self.route)?;
        for pattern_id in &self.pattern_ids {
            validate_identifier("pattern id", pattern_id)?;
        }
        let mut seen = std::collections::HashSet::new();
        for pattern_id in &self.pattern_ids {
            if !seen.insert(pattern_id.as_str()) {
                return Err(format!("duplicate pattern id: {pattern_id}"));
            }
        }
        for context_id in &self.context_ids {
            if context_id.trim().is_empty() {
                return Err("context ids must not be blank".into());
            }
        }
        if let Some(q) = self.quality {
            if !(0.0..=1.0).contains(&q) {
                return Err(format!("quality {q} outside [0, 1]"));
            }
        }
        Ok(())
    }
}

/// `traj-{unix millis}-{8 hex chars}`. Lexicographic order follows creation time.
pub fn generate_trajectory_id(at: DateTime<Utc>) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("traj-{:013}-{}", at.timestamp_millis(), &random[..8])
}

/// Reject identifiers that are blank, oversized, or carry control characters.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(format!(
            "{kind} exceeds {MAX_IDENTIFIER_LEN} bytes: {} bytes",
            value.len()
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(format!("{kind} contains control characters"));
    }
    Ok(())
}

/// A reusable, scored template derived from a high-quality trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub route: String,
    pub source_trajectory: String,
    /// L2-normalized feature-hashed embedding of the route and steps.
    pub embedding: Vec<f32>,
    pub quality: f64,
    /// Compressed step sequence (consecutive duplicates collapsed).
    pub steps: Vec<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// The only field that changes after creation.
    pub usage_count: u64,
}

/// Optional provenance attached to a feedback call and carried into minted patterns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RlmContext {
    pub agent_key: Option<String>,
    pub session_id: Option<String>,
    pub injection_succeeded: Option<bool>,
}

/// Caller-supplied extras for [`provide_feedback`](super::engine::LearningEngine::provide_feedback).
#[derive(Debug, Clone, Default)]
pub struct FeedbackOptions {
    /// Provenance score in `[0, 1]`; `None` means 1.0.
    pub l_score: Option<f64>,
    /// Per-pattern similarity; patterns absent here use 1.0.
    pub similarities: HashMap<String, f64>,
    pub rlm_context: Option<RlmContext>,
    /// Skip the throttled weight-file save at the end of the update.
    pub skip_auto_save: bool,
}

impl FeedbackOptions {
    pub fn with_l_score(mut self, l_score: f64) -> Self {
        self.l_score = Some(l_score);
        self
    }

    pub fn with_similarity(mut self, pattern_id: &str, similarity: f64) -> Self {
        self.similarities.insert(pattern_id.to_string(), similarity);
        self
    }

    pub fn without_auto_save(mut self) -> Self {
        self.skip_auto_save = true;
        self
    }
}

/// Outcome of one feedback call.
#[derive(Debug, Clone, Serialize)]
pub struct WeightUpdateResult {
    pub trajectory_id: String,
    pub weights_updated: usize,
    pub reward: f64,
    pub pattern_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftMetrics>,
    /// `true` if the drift check triggered an automatic rollback.
    pub rolled_back: bool,
}

/// Result of restoring a checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub checkpoint_id: String,
    pub restored_entries: usize,
    pub rollback_count: u64,
}

/// Snapshot of engine state for `stats` surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub routes: usize,
    pub weights: usize,
    pub mean_fisher: f64,
    pub patterns: usize,
    pub trajectories_hot: usize,
    pub trajectories_pending: usize,
    pub trajectories_on_disk: usize,
    pub checkpoints: usize,
    pub baselines: usize,
    pub rollback_count: u64,
    pub safety_state: SafetyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drift: Option<DriftMetrics>,
}
