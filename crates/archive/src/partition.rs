//! `date=YYYY-MM-DD/hour=HH` partitioning by event time.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Timelike, Utc};

/// Archive partition of an event, derived from event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub date: NaiveDate,
    pub hour: u32,
}

impl PartitionKey {
    pub fn for_event_time(event_time: DateTime<Utc>) -> Self {
        Self {
            date: event_time.date_naive(),
            hour: event_time.hour(),
        }
    }

    /// Path relative to the archive root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(format!("date={}", self.date.format("%Y-%m-%d")))
            .join(format!("hour={:02}", self.hour))
    }

    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }

    /// Parses the two directory names of a partition.
    pub fn parse(date_dir: &str, hour_dir: &str) -> Option<Self> {
        let date = NaiveDate::parse_from_str(date_dir.strip_prefix("date=")?, "%Y-%m-%d").ok()?;
        let hour: u32 = hour_dir.strip_prefix("hour=")?.parse().ok()?;
        (hour < 24).then_some(Self { date, hour })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "date={}/hour={:02}", self.date.format("%Y-%m-%d"), self.hour)
    }
}
