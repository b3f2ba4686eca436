use parking_lot::RwLock;
use std::collections::HashSet;

/// Answers whether deleting a trajectory would orphan the last baseline checkpoint.
pub trait BaselineGuard: Send + Sync {
    fn protects(&self, trajectory_id: &str) -> bool;
}

/// Protects nothing. Used by a stream opened without a learning engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBaselineGuard;

impl BaselineGuard for NoBaselineGuard {
    fn protects(&self, _trajectory_id: &str) -> bool {
        false
    }
}

/// Shared set of protected trajectory IDs, refreshed by the engine whenever the
/// checkpoint set changes.
#[derive(Debug, Default)]
pub struct BaselineRegistry {
    ids: RwLock<HashSet<String>>,
}

impl BaselineRegistry {
    pub fn replace(&self, ids: HashSet<String>) {
        *self.ids.write() = ids;
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

impl BaselineGuard for BaselineRegistry {
    fn protects(&self, trajectory_id: &str) -> bool {
        self.ids.read().contains(trajectory_id)
    }
}
