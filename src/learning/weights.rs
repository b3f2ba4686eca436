//! In-memory `(route, pattern) → (weight, fisher)` map.
//!
//! Pure data and arithmetic, no I/O. Routes and patterns are kept in `BTreeMap`s so
//! iteration order is the canonical `(route, pattern)` enumeration the weight codec
//! relies on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{LearningError, LearningResult};

pub const WEIGHT_MIN: f32 = -1.0;
pub const WEIGHT_MAX: f32 = 1.0;
/// Fisher information assigned to entries that have never seen a gradient.
pub const DEFAULT_FISHER: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub weight: f32,
    /// Importance estimate; higher values damp future updates.
    pub fisher: f32,
}

impl Default for WeightEntry {
    fn default() -> Self {
        Self {
            weight: 0.0,
            fisher: DEFAULT_FISHER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightStore {
    routes: BTreeMap<String, BTreeMap<String, WeightEntry>>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight for `(pattern, route)`; absent entries read as 0.0.
    pub fn get_weight(&self, pattern_id: &str, route: &str) -> f32 {
        self.entry(route, pattern_id).map(|e| e.weight).unwrap_or(0.0)
    }

    /// All `(pattern, weight)` pairs of a route in canonical order.
    pub fn get_weights(&self, route: &str) -> Vec<(String, f32)> {
        self.routes
            .get(route)
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|(pattern, e)| (pattern.clone(), e.weight))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fisher information for `(pattern, route)`, or `default` when absent.
    pub fn fisher_or(&self, pattern_id: &str, route: &str, default: f32) -> f32 {
        self.entry(route, pattern_id).map(|e| e.fisher).unwrap_or(default)
    }

    pub fn entry(&self, route: &str, pattern_id: &str) -> Option<&WeightEntry> {
        self.routes.get(route).and_then(|p| p.get(pattern_id))
    }

    /// Set a weight, clamped to `[WEIGHT_MIN, WEIGHT_MAX]`. Creates the entry on first
    /// write with the default Fisher value. Returns the stored (clamped) value.
    pub fn set_weight(&mut self, pattern_id: &str, route: &str, weight: f32) -> LearningResult<f32> {
        if !weight.is_finite() {
            return Err(LearningError::WeightUpdate {
                pattern_id: pattern_id.to_string(),
                reason: format!("non-finite weight {weight}"),
            });
        }
        let clamped = weight.clamp(WEIGHT_MIN, WEIGHT_MAX);
        self.entry_mut(route, pattern_id).weight = clamped;
        Ok(clamped)
    }

    /// Set Fisher information. Negative values are floored at 0.
    pub fn set_fisher(&mut self, pattern_id: &str, route: &str, fisher: f32) -> LearningResult<()> {
        if !fisher.is_finite() {
            return Err(LearningError::WeightUpdate {
                pattern_id: pattern_id.to_string(),
                reason: format!("non-finite fisher information {fisher}"),
            });
        }
        self.entry_mut(route, pattern_id).fisher = fisher.max(0.0);
        Ok(())
    }

    /// Insert a fully-formed entry (used by the codec). Values are clamped like any write.
    pub fn insert(&mut self, route: &str, pattern_id: &str, entry: WeightEntry) {
        let weight = if entry.weight.is_finite() {
            entry.weight.clamp(WEIGHT_MIN, WEIGHT_MAX)
        } else {
            0.0
        };
        let fisher = if entry.fisher.is_finite() {
            entry.fisher.max(0.0)
        } else {
            DEFAULT_FISHER
        };
        *self.entry_mut(route, pattern_id) = WeightEntry { weight, fisher };
    }

    fn entry_mut(&mut self, route: &str, pattern_id: &str) -> &mut WeightEntry {
        self.routes
            .entry(route.to_string())
            .or_default()
            .entry(pattern_id.to_string())
            .or_default()
    }

    /// Canonical `(route, pattern, entry)` enumeration.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &WeightEntry)> {
        self.routes.iter().flat_map(|(route, patterns)| {
            patterns
                .iter()
                .map(move |(pattern, entry)| (route.as_str(), pattern.as_str(), entry))
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Number of `(route, pattern)` entries.
    pub fn len(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mean_fisher(&self) -> f64 {
        let n = self.len();
        if n == 0 {
            return 0.0;
        }
        self.iter().map(|(_, _, e)| e.fisher as f64).sum::<f64>() / n as f64
    }

    /// Flatten `self` and `other` into two equal-length weight vectors over the union of
    /// their keys. Slots missing from one side read as 0.
    pub fn aligned_weights(&self, other: &WeightStore) -> (Vec<f32>, Vec<f32>) {
        let mut keys: Vec<(&str, &str)> = self.iter().map(|(r, p, _)| (r, p)).collect();
        keys.extend(other.iter().map(|(r, p, _)| (r, p)));
        keys.sort_unstable();
        keys.dedup();

        keys.iter()
            .map(|(route, pattern)| {
                (
                    self.get_weight(pattern, route),
                    other.get_weight(pattern, route),
                )
            })
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entries_read_as_zero() {
        let store = WeightStore::new();
        assert_eq!(store.get_weight("p1", "coding.review"), 0.0);
        assert!(store.get_weights("coding.review").is_empty());
        assert_eq!(store.fisher_or("p1", "coding.review", DEFAULT_FISHER), DEFAULT_FISHER);
        assert!(store.is_empty());
    }

    #[test]
    fn writes_are_clamped() {
        let mut store = WeightStore::new();
        assert_eq!(store.set_weight("p1", "r", 3.5).unwrap(), 1.0);
        assert_eq!(store.set_weight("p2", "r", -7.0).unwrap(), -1.0);
        assert_eq!(store.get_weight("p1", "r"), 1.0);
        assert_eq!(store.get_weight("p2", "r"), -1.0);
        assert!(store.set_weight("p3", "r", f32::NAN).is_err());
    }

    #[test]
    fn new_entries_start_with_default_fisher() {
        let mut store = WeightStore::new();
        store.set_weight("p1", "r", 0.2).unwrap();
        assert_eq!(store.entry("r", "p1").unwrap().fisher, DEFAULT_FISHER);
        store.set_fisher("p1", "r", -3.0).unwrap();
        assert_eq!(store.entry("r", "p1").unwrap().fisher, 0.0);
    }

    #[test]
    fn iteration_is_canonical() {
        let mut store = WeightStore::new();
        store.set_weight("b", "r2", 0.1).unwrap();
        store.set_weight("a", "r2", 0.2).unwrap();
        store.set_weight("z", "r1", 0.3).unwrap();
        let keys: Vec<(&str, &str)> = store.iter().map(|(r, p, _)| (r, p)).collect();
        assert_eq!(keys, vec![("r1", "z"), ("r2", "a"), ("r2", "b")]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.route_count(), 2);
    }

    #[test]
    fn aligned_weights_cover_the_union_of_keys() {
        let mut a = WeightStore::new();
        a.set_weight("p1", "r", 0.5).unwrap();
        let mut b = WeightStore::new();
        b.set_weight("p2", "r", -0.5).unwrap();

        let (va, vb) = a.aligned_weights(&b);
        assert_eq!(va, vec![0.5, 0.0]);
        assert_eq!(vb, vec![0.0, -0.5]);
    }
}
