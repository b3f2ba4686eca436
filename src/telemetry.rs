//! Outbound observability hooks.
//!
//! The engine reports every operation (component, name, duration, status) to an
//! injected [`Telemetry`] sink. Sinks are best-effort: a failing sink is logged and
//! ignored, never allowed to abort the operation that produced the event.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Ok,
    Error,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationEvent<'a> {
    pub component: &'a str,
    pub operation: &'a str,
    pub duration: Duration,
    pub status: OperationStatus,
}

/// Sink for structured operation events.
pub trait Telemetry: Send + Sync {
    fn record(&self, event: &OperationEvent<'_>) -> anyhow::Result<()>;
}

/// Default sink: one `tracing` debug event per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, event: &OperationEvent<'_>) -> anyhow::Result<()> {
        tracing::debug!(
            component = event.component,
            operation = event.operation,
            duration_us = event.duration.as_micros() as u64,
            status = event.status.as_str(),
            "operation complete"
        );
        Ok(())
    }
}

/// Measures one operation and reports it on [`finish`](Self::finish).
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    started: Instant,
}

impl OpTimer {
    pub fn start(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            started: Instant::now(),
        }
    }

    pub fn finish<T, E>(self, telemetry: &dyn Telemetry, result: &Result<T, E>) {
        let status = if result.is_ok() {
            OperationStatus::Ok
        } else {
            OperationStatus::Error
        };
        let event = OperationEvent {
            component: self.component,
            operation: self.operation,
            duration: self.started.elapsed(),
            status,
        };
        if let Err(e) = telemetry.record(&event) {
            tracing::warn!(
                component = self.component,
                operation = self.operation,
                error = %e,
                "telemetry sink failed"
            );
        }
    }
}
