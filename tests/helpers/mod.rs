#![allow(dead_code)]

use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use strata::config::{StrataConfig, StreamConfig};
use strata::learning::{EngineDeps, LearningEngine, Pattern, PatternSink};
use strata::storage::{MemoryProbe, MemoryUsage, NoBaselineGuard, StreamDeps, TrajectoryStreamManager};
use strata::telemetry::TracingTelemetry;

/// Reports a fixed memory ratio so tests never depend on the host's RSS.
pub struct FixedProbe(pub f64);

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> Option<MemoryUsage> {
        Some(MemoryUsage {
            used_bytes: (self.0 * 1000.0) as u64,
            limit_bytes: 1000,
        })
    }
}

/// Collects every minted pattern's ID.
#[derive(Default)]
pub struct RecordingSink {
    pub created: Mutex<Vec<String>>,
}

impl PatternSink for RecordingSink {
    fn pattern_created(&self, pattern: &Pattern) -> anyhow::Result<()> {
        self.created.lock().push(pattern.id.clone());
        Ok(())
    }
}

pub struct FailingSink;

impl PatternSink for FailingSink {
    fn pattern_created(&self, _pattern: &Pattern) -> anyhow::Result<()> {
        anyhow::bail!("pattern index unavailable")
    }
}

/// Formatted log output collected in memory. `install` routes the current thread's
/// events here until the returned guard drops.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Default config rooted at `dir`, with a flush timer slow enough to stay out of the way.
pub fn test_config(dir: &Path) -> StrataConfig {
    let mut config = StrataConfig::with_data_dir(dir);
    config.stream.flush_interval_ms = 60_000;
    config
}

pub fn deps() -> EngineDeps {
    EngineDeps {
        memory_probe: Some(Arc::new(FixedProbe(0.1))),
        ..EngineDeps::default()
    }
}

pub async fn open_engine(config: &StrataConfig) -> LearningEngine {
    LearningEngine::open(config.clone(), deps()).await.unwrap()
}

pub fn stream_config() -> StreamConfig {
    StreamConfig {
        flush_interval_ms: 60_000,
        ..StreamConfig::default()
    }
}

pub fn stream_deps() -> StreamDeps {
    StreamDeps {
        memory_probe: Arc::new(FixedProbe(0.1)),
        baseline_guard: Arc::new(NoBaselineGuard),
        telemetry: Arc::new(TracingTelemetry),
    }
}

pub async fn open_stream(dir: &Path, config: StreamConfig) -> TrajectoryStreamManager {
    TrajectoryStreamManager::open(dir, config, stream_deps())
        .await
        .unwrap()
}

pub fn patterns(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
