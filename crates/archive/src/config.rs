//! Archive configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory of the `date=/hour=` tree
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Delay after a partition's first write before its `_SUCCESS` marker
    #[serde(default = "default_commit_delay_secs")]
    pub commit_delay_secs: u64,
    /// Buffered rows that force an early staged write
    #[serde(default = "default_max_buffered_rows")]
    pub max_buffered_rows: usize,
}

fn default_root() -> PathBuf {
    PathBuf::from("./data/sensor-archive")
}

fn default_commit_delay_secs() -> u64 {
    60
}

fn default_max_buffered_rows() -> usize {
    50_000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            commit_delay_secs: default_commit_delay_secs(),
            max_buffered_rows: default_max_buffered_rows(),
        }
    }
}

impl ArchiveConfig {
    pub fn commit_delay(&self) -> Duration {
        Duration::from_secs(self.commit_delay_secs)
    }
}
