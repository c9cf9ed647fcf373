//! Per-partition ingestion.
//!
//! One [`PartitionWorker`] per source partition polls a batch, enriches it
//! and hands it to the sink router and the aggregator shards while holding
//! the ingestion gate for reading. A checkpoint takes the gate for writing,
//! so it always observes whole batches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipeline_core::{
    EnrichedEvent, Error, Result, SensorEvent, Watermark, WatermarkHandle, WatermarkTracker,
};
use redpanda::{resolve_start_offset, PartitionReader, PartitionSource, Polled, RetryPolicy, StartOffset};
use telemetry::{health, metrics};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::{shard_for, AggregatorMessage};
use crate::enrichment::FeatureEnricher;
use crate::router::SinkRouter;

/// Sleep between polls of a partition with nothing to read.
pub const IDLE_POLL: Duration = Duration::from_millis(50);

/// Next offset to read per partition, as of the last dispatched batch.
#[derive(Debug, Default)]
pub struct PartitionOffsets(Mutex<BTreeMap<i32, i64>>);

impl PartitionOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, partition: i32, next_offset: i64) {
        self.0.lock().insert(partition, next_offset);
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.0.lock().get(&partition).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<i32, i64> {
        self.0.lock().clone()
    }
}

/// State shared by the partition workers, the scheduler and the
/// checkpoint coordinator.
pub struct IngestContext {
    /// Read by partition workers per batch, written by checkpoints.
    pub gate: RwLock<()>,
    pub offsets: PartitionOffsets,
    pub tracker: WatermarkTracker,
    pub watermark: WatermarkHandle,
    pub enricher: FeatureEnricher,
    pub router: SinkRouter,
    pub shards: Vec<mpsc::Sender<AggregatorMessage>>,
    pub max_fetch_batch: usize,
}

impl IngestContext {
    /// Enriches a batch and routes it to the sinks and aggregator shards,
    /// preserving input order per destination.
    pub async fn dispatch(&self, events: &[SensorEvent]) -> Result<()> {
        let mut by_shard: Vec<Vec<EnrichedEvent>> = (0..self.shards.len()).map(|_| Vec::new()).collect();

        for enriched in self.enricher.enrich_batch(events) {
            by_shard[shard_for(enriched.building(), self.shards.len())].push(enriched.clone());
            self.router.route_enriched(enriched).await?;
        }

        for (shard, events) in by_shard.into_iter().enumerate() {
            if !events.is_empty() {
                self.send_to_shard(shard, AggregatorMessage::Events(events)).await?;
            }
        }
        Ok(())
    }

    /// Recomputes the global watermark and, when it advanced, publishes it
    /// and sends it to every shard. Callers hold the gate.
    pub async fn publish_watermark(&self) -> Result<Option<Watermark>> {
        let Some(candidate) = self.tracker.compute() else {
            return Ok(None);
        };
        if !self.watermark.advance(candidate) {
            return Ok(None);
        }

        health().pipeline.set_watermark(candidate.timestamp_ms());
        for shard in 0..self.shards.len() {
            self.send_to_shard(shard, AggregatorMessage::Watermark(candidate))
                .await?;
        }
        debug!(
            watermark = %candidate,
            idle_partitions = ?self.tracker.idle_partitions(),
            "Watermark advanced"
        );
        Ok(Some(candidate))
    }

    pub async fn send_to_shard(&self, shard: usize, message: AggregatorMessage) -> Result<()> {
        self.shards[shard]
            .send(message)
            .await
            .map_err(|_| Error::internal(format!("aggregator shard {} stopped", shard)))
    }
}

/// Polls one partition until stopped or its source fails.
pub struct PartitionWorker {
    ctx: Arc<IngestContext>,
    source: PartitionSource,
    stop: watch::Receiver<bool>,
    batches: u64,
}

impl PartitionWorker {
    pub fn new(ctx: Arc<IngestContext>, source: PartitionSource, stop: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            source,
            stop,
            batches: 0,
        }
    }

    /// Batches dispatched so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn into_source(self) -> PartitionSource {
        self.source
    }

    /// Runs until the stop signal, finishing the batch in hand first.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if *self.stop.borrow() {
                return Ok(());
            }

            let polled = tokio::select! {
                biased;
                _ = self.stop.changed() => return Ok(()),
                polled = self.source.poll_batch(self.ctx.max_fetch_batch) => polled?,
            };

            if polled.is_empty() {
                tokio::select! {
                    _ = self.stop.changed() => return Ok(()),
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            }

            self.process(polled).await?;
            self.batches += 1;
        }
    }

    async fn process(&mut self, polled: Vec<Polled>) -> Result<()> {
        let partition = self.source.partition();
        let mut events = Vec::with_capacity(polled.len());
        let mut max_event_ms: Option<i64> = None;

        for item in polled {
            match item {
                Polled::Event { event, .. } => {
                    let event_ms = event.event_time_ms();
                    max_event_ms = Some(max_event_ms.map_or(event_ms, |max| max.max(event_ms)));
                    events.push(event);
                }
                Polled::Corrupt { offset, error } => {
                    metrics().corrupt_records.inc();
                    warn!(partition, offset, error = %error, "Skipping corrupt record");
                }
                Polled::EndOfPartition => {}
            }
        }

        let _gate = self.ctx.gate.read().await;
        if !events.is_empty() {
            self.ctx.dispatch(&events).await?;
        }
        self.ctx.offsets.set(partition, self.source.next_offset());
        match max_event_ms {
            Some(event_ms) => self.ctx.tracker.observe(partition, event_ms),
            None => self.ctx.tracker.touch(partition),
        }
        self.ctx.publish_watermark().await?;

        if !health().source.is_healthy() {
            health().source.set_healthy();
        }
        debug!(
            partition,
            events = events.len(),
            next_offset = self.source.next_offset(),
            "Dispatched batch"
        );
        Ok(())
    }
}

/// Restarts a partition's reader after `SourceUnavailable`.
pub struct PartitionSupervisor {
    pub ctx: Arc<IngestContext>,
    pub reader: Box<dyn PartitionReader>,
    /// Checkpointed next offset, if any
    pub resume_from: Option<i64>,
    pub start_from: StartOffset,
    pub retry: RetryPolicy,
    /// Consecutive restarts allowed without progress
    pub max_restarts: u32,
    pub stop: watch::Receiver<bool>,
}

impl PartitionSupervisor {
    /// Spawns the supervisor; a terminal error is reported on `fatal`.
    pub fn spawn(self, fatal: mpsc::UnboundedSender<Error>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let partition = self.reader.partition();
            if let Err(e) = self.run().await {
                error!(partition, error = %e, "Partition worker halted");
                health().source.set_unhealthy(e.to_string());
                let _ = fatal.send(e);
            }
        })
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            ctx,
            mut reader,
            resume_from,
            start_from,
            retry,
            max_restarts,
            mut stop,
        } = self;
        let partition = reader.partition();
        let mut restarts = 0;

        let mut next_offset = match resume_from {
            Some(offset) => offset,
            None => loop {
                if *stop.borrow() {
                    return Ok(());
                }
                let resolved = tokio::select! {
                    biased;
                    _ = stop.changed() => return Ok(()),
                    resolved = resolve_start_offset(&mut *reader, start_from, &retry) => resolved,
                };
                match resolved {
                    Ok(offset) => break offset,
                    Err(e) => {
                        check_restart(partition, &mut restarts, max_restarts, e)?;
                        reader.reset().await;
                        if backoff_or_stop(&mut stop, retry.backoff(restarts)).await {
                            return Ok(());
                        }
                    }
                }
            },
        };
        ctx.offsets.set(partition, next_offset);

        loop {
            let source = PartitionSource::at_offset(reader, next_offset, retry);
            let mut worker = PartitionWorker::new(ctx.clone(), source, stop.clone());
            let result = worker.run().await;
            let progressed = worker.batches() > 0;
            reader = worker.into_source().into_reader();

            match result {
                Ok(()) => {
                    info!(partition, "Partition worker stopped");
                    return Ok(());
                }
                Err(e) => {
                    if progressed {
                        restarts = 0;
                    }
                    check_restart(partition, &mut restarts, max_restarts, e)?;
                    reader.reset().await;
                    next_offset = ctx.offsets.get(partition).unwrap_or(next_offset);
                    if backoff_or_stop(&mut stop, retry.backoff(restarts)).await {
                        info!(partition, "Partition worker stopped during restart backoff");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Sleeps for `backoff`; true if the stop signal came first.
async fn backoff_or_stop(stop: &mut watch::Receiver<bool>, backoff: Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

fn check_restart(partition: i32, restarts: &mut u32, max_restarts: u32, error: Error) -> Result<()> {
    if !matches!(error, Error::SourceUnavailable { .. }) || *restarts >= max_restarts {
        return Err(error);
    }
    *restarts += 1;
    metrics().partition_restarts.inc();
    health().source.set_unhealthy(error.to_string());
    warn!(partition, restart = *restarts, max_restarts, error = %error, "Restarting partition reader");
    Ok(())
}
