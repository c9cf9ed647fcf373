//! In-memory stand-ins for the broker, the sinks and the checkpoint store.
//!
//! Every mock is a cheap handle over shared state, so a test can keep one
//! clone for assertions while the pipeline owns another, and a restarted
//! pipeline can be pointed at the same partitions, sinks and store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipeline_core::{CheckpointRecord, Error, Result, Sink};
use redpanda::{PartitionReader, SourceRecord, StartOffset};
use worker::CheckpointStore;

/// Records returned by one fetch.
const FETCH_LIMIT: usize = 64;

/// An append-only partition log shared between readers.
#[derive(Clone, Default)]
pub struct MemoryPartition {
    partition: i32,
    log: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    failing_fetches: Arc<AtomicU32>,
    always_fail: Arc<AtomicBool>,
}

impl MemoryPartition {
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            ..Self::default()
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Appends raw payloads; returns the offset of the first one.
    pub fn append_raw(&self, payloads: impl IntoIterator<Item = Vec<u8>>) -> i64 {
        let mut log = self.log.lock();
        let first = log.len() as i64;
        log.extend(payloads.into_iter().map(Some));
        first
    }

    pub fn append(&self, values: &[serde_json::Value]) -> i64 {
        self.append_raw(values.iter().map(crate::fixtures::encode))
    }

    /// Appends a record with no value.
    pub fn append_tombstone(&self) -> i64 {
        let mut log = self.log.lock();
        log.push(None);
        log.len() as i64 - 1
    }

    /// Offset the next appended record will get.
    pub fn end_offset(&self) -> i64 {
        self.log.lock().len() as i64
    }

    /// Makes the next `n` fetches fail with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Makes every fetch fail until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.always_fail.store(unreachable, Ordering::SeqCst);
    }

    pub fn reader(&self) -> Box<dyn PartitionReader> {
        Box::new(MemoryPartitionReader {
            partition: self.clone(),
            resets: 0,
        })
    }
}

/// [`PartitionReader`] over a [`MemoryPartition`].
pub struct MemoryPartitionReader {
    partition: MemoryPartition,
    resets: u32,
}

impl MemoryPartitionReader {
    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn check_reachable(&self) -> Result<()> {
        let p = &self.partition;
        if p.always_fail.load(Ordering::SeqCst) {
            return Err(Error::source_fetch(p.partition, "broker unreachable"));
        }
        let injected = p
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::source_fetch(p.partition, "connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    fn partition(&self) -> i32 {
        self.partition.partition
    }

    async fn resolve_start(&mut self, start: StartOffset) -> Result<i64> {
        self.check_reachable()?;
        Ok(match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => self.partition.end_offset(),
        })
    }

    async fn fetch(&mut self, offset: i64) -> Result<Vec<SourceRecord>> {
        self.check_reachable()?;
        let log = self.partition.log.lock();
        Ok(log
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .take(FETCH_LIMIT)
            .map(|(i, payload)| SourceRecord {
                partition: self.partition.partition,
                offset: i as i64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn reset(&mut self) {
        self.resets += 1;
    }
}

struct Captured<T> {
    records: Vec<T>,
    flushes: Vec<u64>,
    commits: Vec<u64>,
    recovered_from: Vec<Option<u64>>,
}

/// Sink that keeps everything it is given.
pub struct CapturingSink<T> {
    name: &'static str,
    state: Arc<Mutex<Captured<T>>>,
    failures: Arc<AtomicU32>,
    stalled: Arc<AtomicBool>,
}

impl<T> Clone for CapturingSink<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: self.state.clone(),
            failures: self.failures.clone(),
            stalled: self.stalled.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CapturingSink<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(Captured {
                records: Vec::new(),
                flushes: Vec::new(),
                commits: Vec::new(),
                recovered_from: Vec::new(),
            })),
            failures: Arc::new(AtomicU32::new(0)),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn records(&self) -> Vec<T> {
        self.state.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flushes(&self) -> Vec<u64> {
        self.state.lock().flushes.clone()
    }

    pub fn commits(&self) -> Vec<u64> {
        self.state.lock().commits.clone()
    }

    pub fn recovered_from(&self) -> Vec<Option<u64>> {
        self.state.lock().recovered_from.clone()
    }

    /// Makes the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Makes writes hang, so the sink's buffer fills up.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn boxed(&self) -> Box<dyn Sink<T>> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for CapturingSink<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn write_batch(&mut self, records: &[T]) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::sink_write(self.name, "injected failure"));
        }
        self.state.lock().records.extend_from_slice(records);
        Ok(())
    }

    async fn recover(&mut self, restored_checkpoint: Option<u64>) -> Result<()> {
        self.state.lock().recovered_from.push(restored_checkpoint);
        Ok(())
    }

    async fn flush(&mut self, checkpoint_id: u64) -> Result<()> {
        self.state.lock().flushes.push(checkpoint_id);
        Ok(())
    }

    async fn commit(&mut self, checkpoint_id: u64) -> Result<()> {
        self.state.lock().commits.push(checkpoint_id);
        Ok(())
    }
}

/// Checkpoint store kept in memory.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    records: Arc<Mutex<BTreeMap<u64, CheckpointRecord>>>,
    fail_saves: Arc<AtomicBool>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes saves fail, as if the checkpoint volume were gone.
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves.store(failing, Ordering::SeqCst);
    }

    pub fn latest(&self) -> Option<CheckpointRecord> {
        self.records.lock().values().next_back().cloned()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.records.lock().keys().copied().collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::checkpoint("checkpoint volume unavailable"));
        }
        self.records
            .lock()
            .insert(record.checkpoint_id, record.clone());
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.latest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::reading;

    #[tokio::test]
    async fn test_memory_reader_fetches_from_offset() {
        let partition = MemoryPartition::new(2);
        partition.append(&[reading("s1", "B1", 1, 20.0), reading("s2", "B1", 2, 21.0)]);
        partition.append_tombstone();

        let mut reader = partition.reader();
        assert_eq!(reader.partition(), 2);
        assert_eq!(reader.resolve_start(StartOffset::Latest).await.unwrap(), 3);

        let records = reader.fetch(1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 1);
        assert!(records[1].payload.is_none());
    }

    #[tokio::test]
    async fn test_injected_fetch_failures() {
        let partition = MemoryPartition::new(0);
        partition.fail_next_fetches(1);

        let mut reader = partition.reader();
        assert!(reader.fetch(0).await.unwrap_err().is_transient());
        assert!(reader.fetch(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capturing_sink_failures_then_success() {
        let sink = CapturingSink::<u32>::new("test");
        sink.fail_next_writes(1);

        let mut writer = sink.clone();
        assert!(writer.write_batch(&[1, 2]).await.is_err());
        writer.write_batch(&[1, 2]).await.unwrap();
        writer.flush(4).await.unwrap();

        assert_eq!(sink.records(), vec![1, 2]);
        assert_eq!(sink.flushes(), vec![4]);
    }

    #[tokio::test]
    async fn test_memory_store_failing() {
        let store = MemoryCheckpointStore::new();
        store.save(&CheckpointRecord::empty(1)).await.unwrap();
        store.set_failing(true);
        assert!(store.save(&CheckpointRecord::empty(2)).await.is_err());
        assert_eq!(store.load_latest().await.unwrap().unwrap().checkpoint_id, 1);
    }
}
