use std::collections::{HashMap, VecDeque};

use crate::learning::types::Trajectory;

struct Slot {
    trajectory: Trajectory,
    /// Changed since it was last written to disk.
    dirty: bool,
}

/// Bounded, insertion-ordered cache of the most recent trajectories.
pub struct HotWindow {
    capacity: usize,
    slots: HashMap<String, Slot>,
    order: VecDeque<String>,
}

/// A trajectory pushed out of the window. Dirty ones still need writing.
#[derive(Debug)]
pub struct Evicted {
    pub trajectory: Trajectory,
    pub dirty: bool,
}

impl HotWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Trajectory> {
        self.slots.get(id).map(|s| &s.trajectory)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert or replace. Replacing keeps the entry's position; a new entry evicts the
    /// oldest ones once the window is full.
    pub fn put(&mut self, trajectory: Trajectory, dirty: bool) -> Vec<Evicted> {
        if let Some(slot) = self.slots.get_mut(&trajectory.id) {
            slot.trajectory = trajectory;
            slot.dirty |= dirty;
            return Vec::new();
        }

        let mut evicted = Vec::new();
        while self.slots.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                evicted.push(Evicted {
                    trajectory: slot.trajectory,
                    dirty: slot.dirty,
                });
            }
        }

        self.order.push_back(trajectory.id.clone());
        self.slots.insert(trajectory.id.clone(), Slot { trajectory, dirty });
        evicted
    }

    pub fn remove(&mut self, id: &str) -> Option<Trajectory> {
        let slot = self.slots.remove(id)?;
        self.order.retain(|x| x != id);
        Some(slot.trajectory)
    }

    /// Clone out every dirty entry and mark it clean.
    pub fn take_dirty(&mut self) -> Vec<Trajectory> {
        let mut dirty = Vec::new();
        for id in &self.order {
            if let Some(slot) = self.slots.get_mut(id) {
                if slot.dirty {
                    slot.dirty = false;
                    dirty.push(slot.trajectory.clone());
                }
            }
        }
        dirty
    }

    /// Flag an entry as unwritten again. `false` when it is not in the window.
    pub fn mark_dirty(&mut self, id: &str) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) => {
                slot.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.slots.values().filter(|s| s.dirty).count()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.order.iter().filter_map(|id| self.slots.get(id).map(|s| &s.trajectory))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
