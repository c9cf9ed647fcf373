//! Checkpoint snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watermark::Watermark;
use crate::window::WindowAccumulator;

/// Minimal state needed to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: u64,
    pub created_at: DateTime<Utc>,
    /// Next offset to read, per source partition
    pub offsets: BTreeMap<i32, i64>,
    /// Event-time maximum per partition, seeds the watermark tracker
    #[serde(default)]
    pub partition_event_time: BTreeMap<i32, i64>,
    pub watermark: Watermark,
    /// Open window accumulators
    pub windows: Vec<WindowAccumulator>,
}

impl CheckpointRecord {
    pub fn empty(checkpoint_id: u64) -> Self {
        Self {
            checkpoint_id,
            created_at: Utc::now(),
            offsets: BTreeMap::new(),
            partition_event_time: BTreeMap::new(),
            watermark: Watermark::MIN,
            windows: Vec::new(),
        }
    }

    pub fn open_window_count(&self) -> usize {
        self.windows.len()
    }
}
