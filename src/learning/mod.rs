//! The learning side of the engine: pattern weights, the EWC update rule, drift
//! detection, checkpoints and rollback, orchestrated by [`LearningEngine`].

pub mod checkpoint;
pub mod codec;
pub mod drift;
pub mod engine;
pub mod pattern;
pub mod rollback;
pub mod types;
pub mod update;
pub mod weights;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary};
pub use drift::{DriftGuard, DriftMetrics, DriftStatus, SafetyState};
pub use engine::{EngineDeps, LearningEngine};
pub use pattern::{NoopPatternSink, PatternSink};
pub use types::{
    FeedbackOptions, LearningStats, Pattern, RlmContext, RollbackOutcome, Trajectory,
    WeightUpdateResult,
};
pub use weights::WeightStore;
