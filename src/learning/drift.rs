//! Drift detection between the live weights and a baseline snapshot.
//!
//! `drift = 1 − cosine(current, baseline)` over the union of both stores' slots, so
//! it lies in `[0, 2]`. A baseline with no signal (all-zero weights) cannot be drifted
//! away from and always reports 0.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::weights::WeightStore;
use crate::config::SafetyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Ok,
    Warning,
    Critical,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety state machine driven by drift checks and rollbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Stable,
    Drifting,
    RolledBack,
}

impl std::fmt::Display for SafetyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::Drifting => "drifting",
            Self::RolledBack => "rolled_back",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftMetrics {
    pub drift: f64,
    pub cosine_similarity: f64,
    pub status: DriftStatus,
    pub baseline_id: String,
    pub dimensions: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct DriftGuard {
    pub alert_threshold: f64,
    pub reject_threshold: f64,
}

impl From<&SafetyConfig> for DriftGuard {
    fn from(config: &SafetyConfig) -> Self {
        Self {
            alert_threshold: config.drift_alert_threshold,
            reject_threshold: config.drift_reject_threshold,
        }
    }
}

impl Default for DriftGuard {
    fn default() -> Self {
        Self::from(&SafetyConfig::default())
    }
}

impl DriftGuard {
    pub fn classify(&self, drift: f64) -> DriftStatus {
        if drift >= self.reject_threshold {
            DriftStatus::Critical
        } else if drift >= self.alert_threshold {
            DriftStatus::Warning
        } else {
            DriftStatus::Ok
        }
    }

    pub fn check(&self, current: &WeightStore, baseline: &WeightStore, baseline_id: &str) -> DriftMetrics {
        let (current_vec, baseline_vec) = current.aligned_weights(baseline);
        let (similarity, drift) = if norm(&baseline_vec) == 0.0 {
            (1.0, 0.0)
        } else {
            let similarity = cosine_similarity(&current_vec, &baseline_vec);
            (similarity, drift_score(similarity))
        };

        DriftMetrics {
            drift,
            cosine_similarity: similarity,
            status: self.classify(drift),
            baseline_id: baseline_id.to_string(),
            dimensions: current_vec.len(),
            checked_at: Utc::now(),
        }
    }
}

pub fn drift_score(cosine_similarity: f64) -> f64 {
    (1.0 - cosine_similarity).clamp(0.0, 2.0)
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Cosine similarity of two equal-length vectors. Two zero vectors are identical (1.0);
/// a zero vector against a non-zero one is orthogonal (0.0).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 && nb == 0.0 {
        return 1.0;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum();
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(values: &[f32]) -> WeightStore {
        let mut s = WeightStore::new();
        for (i, v) in values.iter().enumerate() {
            s.set_weight(&format!("p{i}"), "r", *v).unwrap();
        }
        s
    }

    #[test]
    fn identical_vectors_have_zero_drift() {
        let guard = DriftGuard::default();
        let a = store(&[0.3, -0.2, 0.9]);
        let m = guard.check(&a, &a.clone(), "ckpt");
        assert!(m.drift.abs() < 1e-12);
        assert_eq!(m.status, DriftStatus::Ok);
        assert_eq!(m.dimensions, 3);
    }

    #[test]
    fn drift_grows_as_vectors_diverge() {
        let guard = DriftGuard::default();
        let baseline = store(&[1.0, 0.0]);
        let mut previous = -1.0;
        // rotate the current vector away from the baseline in steps
        for step in 0..=8 {
            let angle = std::f32::consts::PI * step as f32 / 8.0;
            let current = store(&[angle.cos(), angle.sin()]);
            let drift = guard.check(&current, &baseline, "b").drift;
            assert!(drift >= previous - 1e-9, "drift must not decrease: {drift} < {previous}");
            assert!((0.0..=2.0).contains(&drift));
            previous = drift;
        }
        assert!((previous - 2.0).abs() < 1e-6);
    }

    #[test]
    fn classification_thresholds() {
        let guard = DriftGuard::default();
        assert_eq!(guard.classify(0.0), DriftStatus::Ok);
        assert_eq!(guard.classify(0.29), DriftStatus::Ok);
        assert_eq!(guard.classify(0.3), DriftStatus::Warning);
        assert_eq!(guard.classify(0.49), DriftStatus::Warning);
        assert_eq!(guard.classify(0.5), DriftStatus::Critical);
        assert_eq!(guard.classify(2.0), DriftStatus::Critical);
    }

    #[test]
    fn new_slots_count_as_divergence() {
        let guard = DriftGuard::default();
        let baseline = store(&[0.5]);
        let mut current = baseline.clone();
        current.set_weight("fresh", "other", 0.5).unwrap();
        let m = guard.check(&current, &baseline, "b");
        assert_eq!(m.dimensions, 2);
        assert!(m.drift > 0.0);
    }

    #[test]
    fn zero_baseline_reports_no_drift() {
        let guard = DriftGuard::default();
        let m = guard.check(&store(&[0.8]), &WeightStore::new(), "empty");
        assert_eq!(m.drift, 0.0);
        assert_eq!(m.status, DriftStatus::Ok);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
    }
}
