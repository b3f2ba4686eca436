//! Reward, gradient and regularized weight-update math.
//!
//! ```text
//! reward   = quality × lScore × successRate
//! gradient = (reward − 0.5) × similarity
//! Δw       = learningRate × gradient / (1 + regularization × fisher)
//! w'       = clamp(w + Δw, −1, 1)
//! fisher'  = decay × fisher + (1 − decay) × gradient²
//! ```
//!
//! Updates are planned against a read-only store and committed afterwards, so a failure
//! on any pattern leaves every weight of the trajectory untouched.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::weights::{WeightStore, WEIGHT_MAX, WEIGHT_MIN};
use crate::config::LearningConfig;
use crate::error::{LearningError, LearningResult};

/// Neutral reward: gradients are signed around this value.
pub const REWARD_BASELINE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct UpdateParams {
    pub learning_rate: f64,
    pub regularization: f64,
    pub fisher_decay: f64,
    pub default_fisher: f64,
}

impl From<&LearningConfig> for UpdateParams {
    fn from(config: &LearningConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            regularization: config.regularization,
            fisher_decay: config.fisher_decay,
            default_fisher: config.default_fisher,
        }
    }
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

/// Historical quality observed for one route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    pub count: u64,
    pub mean_quality: f64,
}

impl RouteStats {
    /// Fold one quality observation in. `decay = None` keeps a plain running mean;
    /// `Some(d)` switches to an exponential moving average.
    pub fn record(&mut self, quality: f64, decay: Option<f64>) {
        self.count += 1;
        if self.count == 1 {
            self.mean_quality = quality;
            return;
        }
        self.mean_quality = match decay {
            Some(d) => d * self.mean_quality + (1.0 - d) * quality,
            None => self.mean_quality + (quality - self.mean_quality) / self.count as f64,
        };
    }
}

pub fn success_rate(stats: Option<&RouteStats>, default: f64) -> f64 {
    match stats {
        Some(s) if s.count > 0 => s.mean_quality,
        _ => default,
    }
}

pub fn reward(quality: f64, l_score: f64, success_rate: f64) -> f64 {
    quality * l_score * success_rate
}

pub fn gradient(reward: f64, similarity: f64) -> f64 {
    (reward - REWARD_BASELINE) * similarity
}

/// EWC-damped step: the larger the Fisher information, the smaller the move.
pub fn weight_delta(learning_rate: f64, gradient: f64, regularization: f64, fisher: f64) -> f64 {
    learning_rate * gradient / (1.0 + regularization * fisher)
}

pub fn decayed_fisher(decay: f64, fisher: f64, gradient: f64) -> f64 {
    decay * fisher + (1.0 - decay) * gradient * gradient
}

/// Planned change for one `(pattern, route)` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternUpdate {
    pub pattern_id: String,
    pub old_weight: f32,
    pub new_weight: f32,
    pub gradient: f64,
    pub delta: f64,
    pub new_fisher: f32,
}

/// Inputs of one feedback step for a single trajectory.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackInput<'a> {
    pub route: &'a str,
    pub pattern_ids: &'a [String],
    pub quality: f64,
    pub l_score: f64,
    pub success_rate: f64,
    pub similarities: &'a HashMap<String, f64>,
}

/// Compute the reward and the per-pattern updates without touching the store.
pub fn plan_updates(
    store: &WeightStore,
    input: &FeedbackInput<'_>,
    params: &UpdateParams,
) -> LearningResult<(f64, Vec<PatternUpdate>)> {
    let reward = reward(input.quality, input.l_score, input.success_rate);
    let mut updates = Vec::with_capacity(input.pattern_ids.len());

    for pattern_id in input.pattern_ids {
        let similarity = input.similarities.get(pattern_id).copied().unwrap_or(1.0);
        let grad = gradient(reward, similarity);
        let fisher = store.fisher_or(pattern_id, input.route, params.default_fisher as f32) as f64;
        let old_weight = store.get_weight(pattern_id, input.route);

        let delta = weight_delta(params.learning_rate, grad, params.regularization, fisher);
        let new_weight = (old_weight as f64 + delta).clamp(WEIGHT_MIN as f64, WEIGHT_MAX as f64);
        let new_fisher = decayed_fisher(params.fisher_decay, fisher, grad);

        if !grad.is_finite() || !new_weight.is_finite() || !new_fisher.is_finite() {
            return Err(LearningError::WeightUpdate {
                pattern_id: pattern_id.clone(),
                reason: format!(
                    "non-finite update (gradient {grad}, delta {delta}, fisher {new_fisher})"
                ),
            });
        }

        updates.push(PatternUpdate {
            pattern_id: pattern_id.clone(),
            old_weight,
            new_weight: new_weight as f32,
            gradient: grad,
            delta,
            new_fisher: new_fisher.max(0.0) as f32,
        });
    }

    Ok((reward, updates))
}

/// Apply planned updates to the store.
pub fn commit_updates(
    store: &mut WeightStore,
    route: &str,
    updates: &[PatternUpdate],
) -> LearningResult<()> {
    for update in updates {
        store.set_weight(&update.pattern_id, route, update.new_weight)?;
        store.set_fisher(&update.pattern_id, route, update.new_fisher)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(store: &WeightStore, pattern: &str, quality: f64, success: f64) -> PatternUpdate {
        let patterns = vec![pattern.to_string()];
        let similarities = HashMap::new();
        let input = FeedbackInput {
            route: "coding.review",
            pattern_ids: &patterns,
            quality,
            l_score: 1.0,
            success_rate: success,
            similarities: &similarities,
        };
        let (_, mut updates) = plan_updates(store, &input, &UpdateParams::default()).unwrap();
        updates.remove(0)
    }

    #[test]
    fn first_feedback_nudges_weight_negative() {
        // reward 0.9 × 1 × 0.5 = 0.45, gradient −0.05, Δw = 0.01 × −0.05 / (1 + 0.1 × 0.1)
        let store = WeightStore::new();
        let update = single(&store, "p1", 0.9, 0.5);

        assert!((update.gradient - (-0.05)).abs() < 1e-12);
        let expected = -0.0005 / 1.01;
        assert!((update.delta - expected).abs() < 1e-12);
        assert!((update.new_weight as f64 - expected).abs() < 1e-7);
        // fisher' = 0.9 × 0.1 + 0.1 × 0.0025
        assert!((update.new_fisher as f64 - 0.09025).abs() < 1e-6);
    }

    #[test]
    fn higher_fisher_damps_the_step() {
        let params = UpdateParams::default();
        for grad in [-0.5, -0.05, 0.0, 0.2, 0.45] {
            let low = weight_delta(params.learning_rate, grad, params.regularization, 0.1);
            let high = weight_delta(params.learning_rate, grad, params.regularization, 5.0);
            assert!(high.abs() <= low.abs());
        }
    }

    #[test]
    fn similarity_scales_the_gradient() {
        let mut similarities = HashMap::new();
        similarities.insert("p2".to_string(), 0.5);
        let patterns = vec!["p1".to_string(), "p2".to_string()];
        let input = FeedbackInput {
            route: "r",
            pattern_ids: &patterns,
            quality: 1.0,
            l_score: 1.0,
            success_rate: 1.0,
            similarities: &similarities,
        };
        let (reward, updates) =
            plan_updates(&WeightStore::new(), &input, &UpdateParams::default()).unwrap();
        assert_eq!(reward, 1.0);
        assert!((updates[0].gradient - 0.5).abs() < 1e-12);
        assert!((updates[1].gradient - 0.25).abs() < 1e-12);
    }

    #[test]
    fn commit_writes_weights_and_fisher() {
        let mut store = WeightStore::new();
        let update = single(&store, "p1", 1.0, 1.0);
        commit_updates(&mut store, "coding.review", &[update.clone()]).unwrap();
        assert_eq!(store.get_weight("p1", "coding.review"), update.new_weight);
        assert_eq!(
            store.entry("coding.review", "p1").unwrap().fisher,
            update.new_fisher
        );
    }

    #[test]
    fn running_mean_and_ema_success_rate() {
        let mut mean = RouteStats::default();
        for q in [1.0, 0.0, 0.5] {
            mean.record(q, None);
        }
        assert_eq!(mean.count, 3);
        assert!((mean.mean_quality - 0.5).abs() < 1e-12);

        let mut ema = RouteStats::default();
        ema.record(1.0, Some(0.9));
        ema.record(0.0, Some(0.9));
        assert!((ema.mean_quality - 0.9).abs() < 1e-12);

        assert_eq!(success_rate(None, 0.5), 0.5);
        assert_eq!(success_rate(Some(&mean), 0.5), mean.mean_quality);
    }

    #[test]
    fn non_finite_input_is_an_update_error() {
        let patterns = vec!["p1".to_string()];
        let similarities = HashMap::from([("p1".to_string(), f64::INFINITY)]);
        let input = FeedbackInput {
            route: "r",
            pattern_ids: &patterns,
            quality: 1.0,
            l_score: 1.0,
            success_rate: 1.0,
            similarities: &similarities,
        };
        let err = plan_updates(&WeightStore::new(), &input, &UpdateParams::default()).unwrap_err();
        assert!(matches!(err, LearningError::WeightUpdate { ref pattern_id, .. } if pattern_id == "p1"));
    }
}
