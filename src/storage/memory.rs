//! Memory-pressure guard for stream reads and writes.

use std::sync::Arc;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// Source of process memory readings. `None` means "unknown", which never rejects.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Option<MemoryUsage>;
}

/// Resident set size from `/proc/self/status`, measured against a configured budget or
/// total system memory from `/proc/meminfo`. Unsupported platforms report nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe {
    budget_bytes: Option<u64>,
}

impl ProcMemoryProbe {
    pub fn new(budget_mb: Option<u64>) -> Self {
        Self {
            budget_bytes: budget_mb.map(|mb| mb * 1024 * 1024),
        }
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        let used_bytes = read_kb_field("/proc/self/status", "VmRSS:")?;
        let limit_bytes = match self.budget_bytes {
            Some(budget) => budget,
            None => read_kb_field("/proc/meminfo", "MemTotal:")?,
        };
        Some(MemoryUsage {
            used_bytes,
            limit_bytes,
        })
    }
}

#[cfg(target_os = "linux")]
fn read_kb_field(path: &str, field: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| {
            line.trim_start_matches(field)
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .ok()
        })
        .map(|kb| kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_kb_field(_path: &str, _field: &str) -> Option<u64> {
    None
}

#[derive(Clone)]
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    max_ratio: f64,
}

impl MemoryGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>, max_ratio: f64) -> Self {
        Self { probe, max_ratio }
    }

    /// Reject with `ERR_MEMORY_PRESSURE` when usage is at or above the configured ratio.
    pub fn check(&self) -> StorageResult<()> {
        let Some(usage) = self.probe.sample() else {
            return Ok(());
        };
        let ratio = usage.ratio();
        if ratio >= self.max_ratio {
            tracing::warn!(
                ratio,
                limit = self.max_ratio,
                used_bytes = usage.used_bytes,
                "rejecting stream operation under memory pressure"
            );
            return Err(StorageError::MemoryPressure {
                ratio,
                limit: self.max_ratio,
            });
        }
        Ok(())
    }
}
