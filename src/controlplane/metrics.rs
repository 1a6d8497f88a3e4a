//! Command metrics on a per-orchestrator registry

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

pub struct CommandMetrics {
    registry: Registry,
    commands: IntCounterVec,
    duration: HistogramVec,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

impl CommandMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("storage_commands_total", "Storage commands executed"),
            &["kind", "outcome"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new("storage_command_duration_seconds", "Storage command duration")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["kind"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(commands.clone())).map_err(metrics_error)?;
        registry.register(Box::new(duration.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            commands,
            duration,
        })
    }

    pub fn observe(&self, kind: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.commands.with_label_values(&[kind, outcome]).inc();
        self.duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn count(&self, kind: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failure" };
        self.commands.with_label_values(&[kind, outcome]).get()
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics: {}", e)))
    }
}
