//! Strata: an embedded learning engine for agent runtimes.
//!
//! Strata records *trajectories* (which patterns a route used), turns quality feedback
//! into small, EWC-damped updates of per-route pattern weights, and guards those weights
//! with drift detection and checkpoint rollback. Trajectories live in a streaming store:
//! a bounded hot window in front of append-only, versioned data files.
//!
//! | Data | Location | Format |
//! |------|----------|--------|
//! | Weights | `~/.strata/weights.bin` | Binary, CRC32-checked |
//! | Patterns | `~/.strata/patterns.json` | JSON |
//! | Checkpoints | `~/.strata/checkpoints/` | One weight file per checkpoint |
//! | Trajectories | `~/.strata/trajectories/` | `traj-*.dat` + `index.json` |
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from TOML files and environment variables
//! - [`learning`]: Weights, feedback updates, drift, checkpoints and the [`LearningEngine`]
//! - [`storage`]: The trajectory stream: hot window, data files, index and migration
//! - [`error`]: Typed errors with stable storage error codes
//! - [`telemetry`]: Injected operation-event sink

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod learning;
pub mod storage;
pub mod telemetry;

pub use config::StrataConfig;
pub use error::{LearningError, LearningResult, StorageError, StorageResult};
pub use learning::{EngineDeps, LearningEngine};
pub use storage::TrajectoryStreamManager;
