//! Pipeline metrics.
//!
//! Process-wide atomic counters, gauges and latency histograms. The
//! periodic reporter logs a [`MetricsSnapshot`] and `/metrics` serves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::health::health;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn set(&self, val: i64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub(&self, delta: i64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Millisecond latency histogram.
#[derive(Debug)]
pub struct Histogram {
    /// Upper bounds: 1ms .. 30s, the last bucket also takes overflow
    buckets: [AtomicU64; 12],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 12] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000, 30000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_since(&self, start: std::time::Instant) {
        self.observe(start.elapsed().as_millis() as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// The output channels of the sink router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Enriched,
    Archive,
    Metrics,
    Late,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enriched => "enriched",
            Self::Archive => "archive",
            Self::Metrics => "metrics",
            Self::Late => "late",
        }
    }
}

/// Per-sink metrics.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    pub records_published: Counter,
    pub write_errors: Counter,
    pub send_timeouts: Counter,
    pub queue_depth: Gauge,
    pub write_latency_ms: Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkMetricsSnapshot {
    pub records_published: u64,
    pub write_errors: u64,
    pub send_timeouts: u64,
    pub queue_depth: i64,
    pub write_latency_mean_ms: f64,
}

impl SinkMetrics {
    fn snapshot(&self) -> SinkMetricsSnapshot {
        SinkMetricsSnapshot {
            records_published: self.records_published.get(),
            write_errors: self.write_errors.get(),
            send_timeouts: self.send_timeouts.get(),
            queue_depth: self.queue_depth.get(),
            write_latency_mean_ms: self.write_latency_ms.mean(),
        }
    }
}

/// Collected metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    // Source
    pub events_consumed: Counter,
    pub corrupt_records: Counter,
    pub source_retries: Counter,
    pub partition_restarts: Counter,
    pub fetch_latency_ms: Histogram,

    // Enrichment and aggregation
    pub events_enriched: Counter,
    pub late_events: Counter,
    pub windows_opened: Counter,
    pub windows_emitted: Counter,
    pub open_windows: Gauge,

    // Sinks
    pub enriched_sink: SinkMetrics,
    pub archive_sink: SinkMetrics,
    pub metrics_sink: SinkMetrics,
    pub late_sink: SinkMetrics,
    pub archive_files_committed: Counter,
    pub archive_partitions_committed: Counter,

    // Checkpoints
    pub checkpoints_completed: Counter,
    pub checkpoints_failed: Counter,
    pub checkpoints_skipped: Counter,
    pub checkpoint_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self, kind: SinkKind) -> &SinkMetrics {
        match kind {
            SinkKind::Enriched => &self.enriched_sink,
            SinkKind::Archive => &self.archive_sink,
            SinkKind::Metrics => &self.metrics_sink,
            SinkKind::Late => &self.late_sink,
        }
    }

    /// Late events per enriched event.
    pub fn late_data_rate(&self) -> f64 {
        let enriched = self.events_enriched.get();
        if enriched == 0 {
            0.0
        } else {
            self.late_events.get() as f64 / enriched as f64
        }
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub events_consumed: u64,
    pub corrupt_records: u64,
    pub source_retries: u64,
    pub partition_restarts: u64,
    pub events_enriched: u64,
    pub late_events: u64,
    pub late_data_rate: f64,
    pub windows_opened: u64,
    pub windows_emitted: u64,
    pub open_windows: i64,
    pub enriched_sink: SinkMetricsSnapshot,
    pub archive_sink: SinkMetricsSnapshot,
    pub metrics_sink: SinkMetricsSnapshot,
    pub late_sink: SinkMetricsSnapshot,
    pub archive_files_committed: u64,
    pub archive_partitions_committed: u64,
    pub checkpoints_completed: u64,
    pub checkpoints_failed: u64,
    pub checkpoints_skipped: u64,
    pub checkpoint_lag_seconds: f64,
    pub fetch_latency_mean_ms: f64,
    pub checkpoint_latency_mean_ms: f64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        MetricsSnapshot {
            timestamp: now,
            events_consumed: self.events_consumed.get(),
            corrupt_records: self.corrupt_records.get(),
            source_retries: self.source_retries.get(),
            partition_restarts: self.partition_restarts.get(),
            events_enriched: self.events_enriched.get(),
            late_events: self.late_events.get(),
            late_data_rate: self.late_data_rate(),
            windows_opened: self.windows_opened.get(),
            windows_emitted: self.windows_emitted.get(),
            open_windows: self.open_windows.get(),
            enriched_sink: self.enriched_sink.snapshot(),
            archive_sink: self.archive_sink.snapshot(),
            metrics_sink: self.metrics_sink.snapshot(),
            late_sink: self.late_sink.snapshot(),
            archive_files_committed: self.archive_files_committed.get(),
            archive_partitions_committed: self.archive_partitions_committed.get(),
            checkpoints_completed: self.checkpoints_completed.get(),
            checkpoints_failed: self.checkpoints_failed.get(),
            checkpoints_skipped: self.checkpoints_skipped.get(),
            checkpoint_lag_seconds: health().pipeline.checkpoint_lag_seconds(now),
            fetch_latency_mean_ms: self.fetch_latency_ms.mean(),
            checkpoint_latency_mean_ms: self.checkpoint_latency_ms.mean(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
