//! Error taxonomy for the learning engine and the trajectory store.
//!
//! [`LearningError`] groups failures by how callers should react: validation errors are
//! caller mistakes, safety errors block further automatic action, persistence errors are
//! I/O or format failures. [`StorageError`] carries the stable `ERR_*` codes of the
//! trajectory store, exposed through [`StorageError::code`].

use thiserror::Error;

pub type LearningResult<T> = std::result::Result<T, LearningError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum LearningError {
    #[error("invalid trajectory: {0}")]
    TrajectoryValidation(String),

    #[error("invalid feedback: {0}")]
    FeedbackValidation(String),

    #[error("trajectory not found: {0}")]
    TrajectoryNotFound(String),

    #[error("weight update failed for pattern {pattern_id}: {reason}")]
    WeightUpdate { pattern_id: String, reason: String },

    #[error("drift {drift:.4} exceeds reject threshold {threshold:.4}")]
    DriftExceeded { drift: f64, threshold: f64 },

    #[error("rollback refused: {0}")]
    RollbackLoop(String),

    #[error("weight persistence failed: {0}")]
    WeightPersistence(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LearningError {
    /// Validation errors are caller mistakes and are never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::TrajectoryValidation(_) | Self::FeedbackValidation(_)
        )
    }

    /// Safety errors intentionally block automatic action until someone intervenes.
    pub fn is_safety(&self) -> bool {
        matches!(self, Self::DriftExceeded { .. } | Self::RollbackLoop(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("trajectory {id} backs the last baseline checkpoint; pass force to delete it")]
    DeleteBaseline { id: String },

    #[error("migration to v{target} failed: {reason}")]
    MigrationFailed { target: u8, reason: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("query queue full ({waiting} waiting)")]
    QueryQueueFull { waiting: usize },

    #[error("memory pressure {ratio:.2} exceeds limit {limit:.2}")]
    MemoryPressure { ratio: f64, limit: f64 },

    #[error("corrupted record in file {file} at offset {offset}: {reason}")]
    RecordCorrupted { file: u32, offset: u64, reason: String },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    /// Kept so callers matching on legacy codes still compile; the store assumes a
    /// single owning process and never raises it.
    #[error("storage directory is owned by another process")]
    MultiProcessConflict,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeleteBaseline { .. } => "ERR_DELETE_BASELINE",
            Self::MigrationFailed { .. } => "ERR_MIGRATION_FAILED",
            Self::BackupFailed(_) => "ERR_BACKUP_FAILED",
            Self::IndexCorrupted(_) => "ERR_INDEX_CORRUPTED",
            Self::QueryQueueFull { .. } => "ERR_QUERY_QUEUE_FULL",
            Self::MemoryPressure { .. } => "ERR_MEMORY_PRESSURE",
            Self::RecordCorrupted { .. } => "ERR_RECORD_CORRUPTED",
            Self::UnsupportedVersion(_) => "ERR_UNSUPPORTED_VERSION",
            Self::MultiProcessConflict => "ERR_MULTI_PROCESS",
            Self::Io(_) => "ERR_IO",
            Self::Serialization(_) => "ERR_SERIALIZATION",
        }
    }

    /// Backpressure errors: the caller should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueryQueueFull { .. } | Self::MemoryPressure { .. }
        )
    }
}
