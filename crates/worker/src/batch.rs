//! Size- and age-bounded record batches for the sink workers.

use std::time::{Duration, Instant};

/// Records awaiting a write.
#[derive(Debug)]
pub struct PendingBatch<T> {
    records: Vec<T>,
    created_at: Option<Instant>,
}

impl<T> PendingBatch<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            created_at: None,
        }
    }

    pub fn push(&mut self, record: T) {
        if self.records.is_empty() {
            self.created_at = Some(Instant::now());
        }
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the batch must be written regardless of size, `None` if empty.
    pub fn deadline(&self, max_age: Duration) -> Option<Instant> {
        self.created_at.map(|created| created + max_age)
    }

    pub fn take(&mut self) -> Vec<T> {
        self.created_at = None;
        std::mem::take(&mut self.records)
    }
}

impl<T> Default for PendingBatch<T> {
    fn default() -> Self {
        Self::new()
    }
}
