//! Health check aggregation.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::metrics::{metrics, SinkKind};

/// Overall pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Component health state.
///
/// A component is reported only once it has been started or has failed.
#[derive(Debug)]
pub struct ComponentHealth {
    name: &'static str,
    reported: AtomicBool,
    healthy: AtomicBool,
    message: parking_lot::RwLock<Option<String>>,
}

impl ComponentHealth {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            reported: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            message: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_healthy(&self) {
        self.reported.store(true, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
        *self.message.write() = None;
    }

    pub fn set_unhealthy(&self, msg: impl Into<String>) {
        self.reported.store(true, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Relaxed);
        *self.message.write() = Some(msg.into());
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message(&self) -> Option<String> {
        self.message.read().clone()
    }

    fn report(&self) -> ComponentHealthReport {
        ComponentHealthReport {
            name: self.name.to_string(),
            healthy: self.is_healthy(),
            message: self.message(),
        }
    }
}

/// Live pipeline status published by the workers.
#[derive(Debug)]
pub struct PipelineStatus {
    consuming: AtomicBool,
    last_watermark_ms: AtomicI64,
    started_at_ms: AtomicI64,
    last_checkpoint_ms: AtomicI64,
}

impl PipelineStatus {
    const NONE: i64 = i64::MIN;

    pub const fn new() -> Self {
        Self {
            consuming: AtomicBool::new(false),
            last_watermark_ms: AtomicI64::new(Self::NONE),
            started_at_ms: AtomicI64::new(Self::NONE),
            last_checkpoint_ms: AtomicI64::new(Self::NONE),
        }
    }

    pub fn mark_started(&self) {
        self.started_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_consuming(&self, consuming: bool) {
        self.consuming.store(consuming, Ordering::Relaxed);
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Relaxed)
    }

    pub fn set_watermark(&self, watermark_ms: i64) {
        self.last_watermark_ms.fetch_max(watermark_ms, Ordering::Relaxed);
    }

    pub fn last_watermark(&self) -> Option<DateTime<Utc>> {
        millis(self.last_watermark_ms.load(Ordering::Relaxed))
    }

    pub fn record_checkpoint(&self, at: DateTime<Utc>) {
        self.last_checkpoint_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        millis(self.last_checkpoint_ms.load(Ordering::Relaxed))
    }

    /// Seconds since the last successful checkpoint, or since start when
    /// none has completed yet.
    pub fn checkpoint_lag_seconds(&self, now: DateTime<Utc>) -> f64 {
        let since = match self.last_checkpoint_ms.load(Ordering::Relaxed) {
            Self::NONE => self.started_at_ms.load(Ordering::Relaxed),
            at => at,
        };
        if since == Self::NONE {
            return 0.0;
        }
        ((now.timestamp_millis() - since).max(0) as f64) / 1000.0
    }
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == PipelineStatus::NONE {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Aggregated health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consuming: bool,
    pub last_watermark: Option<DateTime<Utc>>,
    pub open_window_count: i64,
    pub checkpoint_lag_seconds: f64,
    pub late_events: u64,
    pub components: Vec<ComponentHealthReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealthReport {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Global health registry.
pub struct HealthRegistry {
    pub source: ComponentHealth,
    pub enriched_sink: ComponentHealth,
    pub archive_sink: ComponentHealth,
    pub metrics_sink: ComponentHealth,
    pub late_sink: ComponentHealth,
    pub checkpoint: ComponentHealth,
    pub pipeline: PipelineStatus,
}

impl HealthRegistry {
    pub const fn new() -> Self {
        Self {
            source: ComponentHealth::new("source"),
            enriched_sink: ComponentHealth::new("enriched_sink"),
            archive_sink: ComponentHealth::new("archive_sink"),
            metrics_sink: ComponentHealth::new("metrics_sink"),
            late_sink: ComponentHealth::new("late_sink"),
            checkpoint: ComponentHealth::new("checkpoint"),
            pipeline: PipelineStatus::new(),
        }
    }

    pub fn sink(&self, kind: SinkKind) -> &ComponentHealth {
        match kind {
            SinkKind::Enriched => &self.enriched_sink,
            SinkKind::Archive => &self.archive_sink,
            SinkKind::Metrics => &self.metrics_sink,
            SinkKind::Late => &self.late_sink,
        }
    }

    fn components(&self) -> [&ComponentHealth; 6] {
        [
            &self.source,
            &self.enriched_sink,
            &self.archive_sink,
            &self.metrics_sink,
            &self.late_sink,
            &self.checkpoint,
        ]
    }

    /// Generate a health report.
    ///
    /// Unhealthy when not consuming; degraded when any component is failing
    /// (including a source that is being restarted) or checkpoint lag
    /// exceeds `lag_alert_secs`.
    pub fn report(&self, lag_alert_secs: f64) -> HealthReport {
        let components: Vec<ComponentHealthReport> = self
            .components()
            .iter()
            .filter(|c| c.is_reported())
            .map(|c| c.report())
            .collect();

        let consuming = self.pipeline.is_consuming();
        let lag = self.pipeline.checkpoint_lag_seconds(Utc::now());

        let status = if !consuming {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| !c.healthy) || lag > lag_alert_secs {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            consuming,
            last_watermark: self.pipeline.last_watermark(),
            open_window_count: metrics().open_windows.get(),
            checkpoint_lag_seconds: lag,
            late_events: metrics().late_events.get(),
            components,
        }
    }

    /// Ready to serve while the pipeline is consuming.
    pub fn is_ready(&self) -> bool {
        self.pipeline.is_consuming()
    }

    pub fn is_alive(&self) -> bool {
        true
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global health registry.
pub static HEALTH: std::sync::LazyLock<HealthRegistry> =
    std::sync::LazyLock::new(HealthRegistry::new);

/// Get the global health registry.
pub fn health() -> &'static HealthRegistry {
    &HEALTH
}
