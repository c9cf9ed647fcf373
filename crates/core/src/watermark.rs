//! Event-time watermarks.
//!
//! A [`WatermarkTracker`] derives the global watermark from per-partition
//! event-time maxima. The result is published through a [`WatermarkHandle`],
//! which only ever moves forward.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Event-time lower bound in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub i64);

impl Watermark {
    /// No watermark observed yet.
    pub const MIN: Watermark = Watermark(i64::MIN);

    pub fn new(timestamp_ms: i64) -> Self {
        Self(timestamp_ms)
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.0
    }

    pub fn is_min(&self) -> bool {
        self.0 == i64::MIN
    }

    /// `None` until a watermark has been observed.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_min() {
            return None;
        }
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "none"),
        }
    }
}

/// Shared, monotonically published watermark.
///
/// Writers call [`WatermarkHandle::advance`]; every reader sees a
/// non-decreasing sequence.
#[derive(Debug, Clone)]
pub struct WatermarkHandle {
    inner: Arc<AtomicI64>,
}

impl WatermarkHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub fn starting_at(watermark: Watermark) -> Self {
        Self {
            inner: Arc::new(AtomicI64::new(watermark.0)),
        }
    }

    /// Current global watermark.
    pub fn current(&self) -> Watermark {
        Watermark(self.inner.load(Ordering::Acquire))
    }

    /// Publishes `candidate` if it moves the watermark forward.
    ///
    /// Returns true when the published value changed.
    pub fn advance(&self, candidate: Watermark) -> bool {
        let previous = self.inner.fetch_max(candidate.0, Ordering::AcqRel);
        candidate.0 > previous
    }
}

impl Default for WatermarkHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct PartitionProgress {
    max_event_ms: i64,
    last_activity: Instant,
}

/// Per-partition bounded-out-of-orderness watermark tracking.
///
/// The watermark of a partition is `max(event_time) - bounded_lateness`.
/// The global watermark is the minimum over partitions that are not idle.
/// With every partition idle the global watermark holds.
#[derive(Debug)]
pub struct WatermarkTracker {
    bounded_lateness_ms: i64,
    idle_timeout: Option<Duration>,
    partitions: Mutex<BTreeMap<i32, PartitionProgress>>,
}

impl WatermarkTracker {
    /// `idle_timeout` of `None` disables idle detection.
    pub fn new(bounded_lateness: Duration, idle_timeout: Option<Duration>) -> Self {
        Self {
            bounded_lateness_ms: bounded_lateness.as_millis() as i64,
            idle_timeout,
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn bounded_lateness_ms(&self) -> i64 {
        self.bounded_lateness_ms
    }

    /// Registers a partition with no events yet. It gates the watermark
    /// until it produces data or goes idle.
    pub fn register(&self, partition: i32) {
        self.partitions
            .lock()
            .entry(partition)
            .or_insert(PartitionProgress {
                max_event_ms: i64::MIN,
                last_activity: Instant::now(),
            });
    }

    /// Seeds a partition's event-time maximum from a checkpoint.
    pub fn seed(&self, partition: i32, max_event_ms: i64) {
        let mut partitions = self.partitions.lock();
        let progress = partitions.entry(partition).or_insert(PartitionProgress {
            max_event_ms: i64::MIN,
            last_activity: Instant::now(),
        });
        progress.max_event_ms = progress.max_event_ms.max(max_event_ms);
    }

    pub fn observe(&self, partition: i32, event_ms: i64) {
        self.observe_at(partition, event_ms, Instant::now());
    }

    pub fn observe_at(&self, partition: i32, event_ms: i64, now: Instant) {
        let mut partitions = self.partitions.lock();
        let progress = partitions.entry(partition).or_insert(PartitionProgress {
            max_event_ms: i64::MIN,
            last_activity: now,
        });
        progress.max_event_ms = progress.max_event_ms.max(event_ms);
        progress.last_activity = now;
    }

    /// Marks a partition active without an event (e.g. it fetched only
    /// corrupt records).
    pub fn touch(&self, partition: i32) {
        if let Some(progress) = self.partitions.lock().get_mut(&partition) {
            progress.last_activity = Instant::now();
        }
    }

    /// Global watermark candidate, `None` when every partition is idle.
    pub fn compute(&self) -> Option<Watermark> {
        self.compute_at(Instant::now())
    }

    pub fn compute_at(&self, now: Instant) -> Option<Watermark> {
        let partitions = self.partitions.lock();
        partitions
            .values()
            .filter(|progress| !self.is_idle(progress, now))
            .map(|progress| {
                Watermark(progress.max_event_ms.saturating_sub(self.bounded_lateness_ms))
            })
            .min()
    }

    /// Partitions currently excluded from the global watermark.
    pub fn idle_partitions(&self) -> Vec<i32> {
        let now = Instant::now();
        self.partitions
            .lock()
            .iter()
            .filter(|(_, progress)| self.is_idle(progress, now))
            .map(|(partition, _)| *partition)
            .collect()
    }

    /// Event-time maxima of partitions that have seen data.
    pub fn partition_event_times(&self) -> BTreeMap<i32, i64> {
        self.partitions
            .lock()
            .iter()
            .filter(|(_, progress)| progress.max_event_ms != i64::MIN)
            .map(|(partition, progress)| (*partition, progress.max_event_ms))
            .collect()
    }

    fn is_idle(&self, progress: &PartitionProgress, now: Instant) -> bool {
        match self.idle_timeout {
            Some(timeout) => now.saturating_duration_since(progress.last_activity) > timeout,
            None => false,
        }
    }
}
