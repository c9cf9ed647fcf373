//! Event source adapter.
//!
//! A [`PartitionReader`] fetches raw records from one partition of the
//! source topic. [`PartitionSource`] wraps a reader with a record buffer,
//! bounded retry and decoding, and hands out events in partition order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_core::{decode_sensor_event, Error, Result, SensorEvent};
use rskafka::client::{
    partition::{OffsetAt, PartitionClient, UnknownTopicHandling},
    Client,
};
use telemetry::metrics;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, StartOffset};

/// One raw record of the source topic.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Raw access to a single source partition.
#[async_trait]
pub trait PartitionReader: Send {
    fn partition(&self) -> i32;

    /// Resolves the first offset to read when no checkpoint exists.
    async fn resolve_start(&mut self, start: StartOffset) -> Result<i64>;

    /// Fetches records at or after `offset`. An empty result means nothing
    /// is available right now.
    async fn fetch(&mut self, offset: i64) -> Result<Vec<SourceRecord>>;

    /// Drops any cached connection state after a failure.
    async fn reset(&mut self);
}

/// [`PartitionReader`] over a Redpanda partition.
pub struct KafkaPartitionReader {
    client: Arc<Client>,
    topic: String,
    partition: i32,
    fetch_max_bytes: i32,
    fetch_max_wait_ms: i32,
    partition_client: Option<Arc<PartitionClient>>,
}

impl KafkaPartitionReader {
    pub fn new(client: Arc<Client>, config: &SourceConfig, partition: i32) -> Self {
        Self {
            client,
            topic: config.topic.clone(),
            partition,
            fetch_max_bytes: config.fetch_max_bytes,
            fetch_max_wait_ms: config.fetch_max_wait_ms,
            partition_client: None,
        }
    }

    async fn ensure_connected(&mut self) -> Result<Arc<PartitionClient>> {
        if let Some(ref client) = self.partition_client {
            return Ok(client.clone());
        }

        let client = self
            .client
            .partition_client(self.topic.clone(), self.partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| {
                Error::source_fetch(self.partition, format!("partition client: {}", e))
            })?;

        let client = Arc::new(client);
        self.partition_client = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn resolve_start(&mut self, start: StartOffset) -> Result<i64> {
        let client = self.ensure_connected().await?;
        let at = match start {
            StartOffset::Earliest => OffsetAt::Earliest,
            StartOffset::Latest => OffsetAt::Latest,
        };

        client
            .get_offset(at)
            .await
            .map_err(|e| Error::source_fetch(self.partition, format!("get offset: {}", e)))
    }

    async fn fetch(&mut self, offset: i64) -> Result<Vec<SourceRecord>> {
        let client = self.ensure_connected().await?;

        let (records, _high_watermark) = client
            .fetch_records(offset, 1..self.fetch_max_bytes, self.fetch_max_wait_ms)
            .await
            .map_err(|e| Error::source_fetch(self.partition, format!("fetch: {}", e)))?;

        // Compressed batches may start before the requested offset.
        Ok(records
            .into_iter()
            .filter(|r| r.offset >= offset)
            .map(|r| SourceRecord {
                partition: self.partition,
                offset: r.offset,
                payload: r.record.value,
            })
            .collect())
    }

    async fn reset(&mut self) {
        self.partition_client = None;
    }
}

/// Retry budget for transient source failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_secs(10),
        }
    }

    /// Exponential backoff for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SourceConfig::default())
    }
}

/// Result of polling a partition.
#[derive(Debug)]
pub enum Polled {
    Event { offset: i64, event: SensorEvent },
    /// A record that failed to decode; it is skipped.
    Corrupt { offset: i64, error: Error },
    /// Nothing is available right now.
    EndOfPartition,
}

/// Ordered, retrying reader of one partition.
pub struct PartitionSource {
    reader: Box<dyn PartitionReader>,
    retry: RetryPolicy,
    next_offset: i64,
    buffer: VecDeque<SourceRecord>,
}

impl PartitionSource {
    /// Opens a partition at `resume_from` (a checkpointed next offset), or
    /// at `start_from` when there is none.
    pub async fn open(
        mut reader: Box<dyn PartitionReader>,
        resume_from: Option<i64>,
        start_from: StartOffset,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let next_offset = match resume_from {
            Some(offset) => offset,
            None => resolve_start_offset(&mut *reader, start_from, &retry).await?,
        };
        Ok(Self::at_offset(reader, next_offset, retry))
    }

    /// Wraps a reader positioned at `next_offset`.
    pub fn at_offset(reader: Box<dyn PartitionReader>, next_offset: i64, retry: RetryPolicy) -> Self {
        info!(partition = reader.partition(), offset = next_offset, "Partition source opened");
        Self {
            reader,
            retry,
            next_offset,
            buffer: VecDeque::new(),
        }
    }

    pub fn partition(&self) -> i32 {
        self.reader.partition()
    }

    /// Offset following the last record handed out.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Gives the reader back, dropping buffered records.
    pub fn into_reader(self) -> Box<dyn PartitionReader> {
        self.reader
    }

    /// Next record of the partition, fetching when the buffer is empty.
    pub async fn next_event(&mut self) -> Result<Polled> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }

        let Some(record) = self.buffer.pop_front() else {
            return Ok(Polled::EndOfPartition);
        };
        self.next_offset = record.offset + 1;
        metrics().events_consumed.inc();

        let decoded = record
            .payload
            .as_deref()
            .ok_or_else(|| Error::corrupt("record has no value"))
            .and_then(decode_sensor_event);

        Ok(match decoded {
            Ok(event) => Polled::Event {
                offset: record.offset,
                event,
            },
            Err(error) => Polled::Corrupt {
                offset: record.offset,
                error,
            },
        })
    }

    /// Up to `max` records: one fetch at most, then whatever is buffered.
    /// Empty when the partition has nothing available.
    pub async fn poll_batch(&mut self, max: usize) -> Result<Vec<Polled>> {
        let mut batch = Vec::new();
        loop {
            match self.next_event().await? {
                Polled::EndOfPartition => break,
                polled => batch.push(polled),
            }
            if batch.len() >= max || !self.has_buffered() {
                break;
            }
        }
        Ok(batch)
    }

    async fn fill(&mut self) -> Result<()> {
        let partition = self.partition();
        let mut attempt = 0;

        loop {
            let start = Instant::now();
            match self.reader.fetch(self.next_offset).await {
                Ok(records) => {
                    metrics().fetch_latency_ms.observe_since(start);
                    if !records.is_empty() {
                        debug!(
                            partition,
                            offset = self.next_offset,
                            count = records.len(),
                            "Fetched records"
                        );
                    }
                    self.buffer.extend(records);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    retry_or_fail(&mut *self.reader, &self.retry, partition, attempt, e).await?;
                }
            }
        }
    }
}

/// First offset to read when there is no checkpoint, with retries.
pub async fn resolve_start_offset(
    reader: &mut dyn PartitionReader,
    start_from: StartOffset,
    retry: &RetryPolicy,
) -> Result<i64> {
    let partition = reader.partition();
    let mut attempt = 0;
    loop {
        match reader.resolve_start(start_from).await {
            Ok(offset) => return Ok(offset),
            Err(e) => {
                attempt += 1;
                retry_or_fail(reader, retry, partition, attempt, e).await?;
            }
        }
    }
}

/// Sleeps before the next attempt, or returns the terminal error.
async fn retry_or_fail(
    reader: &mut dyn PartitionReader,
    retry: &RetryPolicy,
    partition: i32,
    attempt: u32,
    error: Error,
) -> Result<()> {
    if !error.is_transient() {
        return Err(error);
    }
    if attempt > retry.max_retries {
        return Err(Error::source_unavailable(partition, attempt, error.to_string()));
    }

    let backoff = retry.backoff(attempt);
    metrics().source_retries.inc();
    warn!(
        partition,
        attempt,
        backoff_ms = backoff.as_millis() as u64,
        error = %error,
        "Source fetch failed, retrying"
    );

    reader.reset().await;
    tokio::time::sleep(backoff).await;
    Ok(())
}
