//! Pipeline assembly, restore and shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pipeline_core::{
    CheckpointRecord, EnrichedEvent, Error, LateEvent, Result, Sink, Watermark, WatermarkHandle,
    WatermarkTracker, WindowAccumulator, WindowSummary,
};
use redpanda::{PartitionReader, RetryPolicy, StartOffset};
use serde::{Deserialize, Serialize};
use telemetry::{health, SinkKind};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::{shard_for, AggregatorShard, WindowAggregator};
use crate::checkpoint::{CheckpointConfig, CheckpointCoordinator};
use crate::checkpoint_store::{load_restore_point, CheckpointStore};
use crate::enrichment::FeatureEnricher;
use crate::ingest::{IngestContext, PartitionOffsets, PartitionSupervisor};
use crate::router::{SinkRouter, SinkSettings, SinkWorker};
use crate::scheduler::{Scheduler, SchedulerConfig};

const SHARD_CHANNEL_CAPACITY: usize = 1_024;
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_bounded_lateness_ms")]
    pub bounded_lateness_ms: u64,
    #[serde(default = "default_window_size_secs")]
    pub window_size_secs: u64,
    /// Silence after which a partition stops gating the watermark; 0 disables
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_aggregator_shards")]
    pub aggregator_shards: usize,
    #[serde(default = "default_sink_buffer_capacity")]
    pub sink_buffer_capacity: usize,
    #[serde(default = "default_sink_send_timeout_ms")]
    pub sink_send_timeout_ms: u64,
    #[serde(default = "default_sink_batch_size")]
    pub sink_batch_size: usize,
    #[serde(default = "default_sink_batch_timeout_ms")]
    pub sink_batch_timeout_ms: u64,
    #[serde(default = "default_max_partition_restarts")]
    pub max_partition_restarts: u32,
    #[serde(default = "default_max_fetch_batch")]
    pub max_fetch_batch: usize,
}

fn default_bounded_lateness_ms() -> u64 {
    pipeline_core::constants::DEFAULT_BOUNDED_LATENESS_MS as u64
}

fn default_window_size_secs() -> u64 {
    (pipeline_core::constants::DEFAULT_WINDOW_SIZE_MS / 1_000) as u64
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_aggregator_shards() -> usize {
    1
}

fn default_sink_buffer_capacity() -> usize {
    10_000
}

fn default_sink_send_timeout_ms() -> u64 {
    30_000
}

fn default_sink_batch_size() -> usize {
    500
}

fn default_sink_batch_timeout_ms() -> u64 {
    200
}

fn default_max_partition_restarts() -> u32 {
    3
}

fn default_max_fetch_batch() -> usize {
    1_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bounded_lateness_ms: default_bounded_lateness_ms(),
            window_size_secs: default_window_size_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            aggregator_shards: default_aggregator_shards(),
            sink_buffer_capacity: default_sink_buffer_capacity(),
            sink_send_timeout_ms: default_sink_send_timeout_ms(),
            sink_batch_size: default_sink_batch_size(),
            sink_batch_timeout_ms: default_sink_batch_timeout_ms(),
            max_partition_restarts: default_max_partition_restarts(),
            max_fetch_batch: default_max_fetch_batch(),
        }
    }
}

impl PipelineConfig {
    pub fn window_size_ms(&self) -> i64 {
        (self.window_size_secs.max(1) * 1_000) as i64
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            capacity: self.sink_buffer_capacity,
            send_timeout: Duration::from_millis(self.sink_send_timeout_ms),
            batch_size: self.sink_batch_size,
            batch_timeout: Duration::from_millis(self.sink_batch_timeout_ms),
        }
    }
}

/// Collects the parts of a pipeline and starts it.
pub struct PipelineBuilder {
    config: PipelineConfig,
    checkpoint: CheckpointConfig,
    scheduler: SchedulerConfig,
    readers: Vec<Box<dyn PartitionReader>>,
    enriched_sink: Option<Box<dyn Sink<EnrichedEvent>>>,
    archive_sink: Option<Box<dyn Sink<EnrichedEvent>>>,
    metrics_sink: Option<Box<dyn Sink<WindowSummary>>>,
    late_sink: Option<Box<dyn Sink<LateEvent>>>,
    store: Option<Arc<dyn CheckpointStore>>,
    start_from: StartOffset,
    retry: RetryPolicy,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig, checkpoint: CheckpointConfig) -> Self {
        let scheduler = SchedulerConfig {
            checkpoint_interval: checkpoint.interval(),
            lag_alert_secs: checkpoint.lag_alert_secs as f64,
            ..SchedulerConfig::default()
        };
        Self {
            config,
            checkpoint,
            scheduler,
            readers: Vec::new(),
            enriched_sink: None,
            archive_sink: None,
            metrics_sink: None,
            late_sink: None,
            store: None,
            start_from: StartOffset::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn partition(mut self, reader: Box<dyn PartitionReader>) -> Self {
        self.readers.push(reader);
        self
    }

    pub fn partitions(mut self, readers: impl IntoIterator<Item = Box<dyn PartitionReader>>) -> Self {
        self.readers.extend(readers);
        self
    }

    pub fn enriched_sink(mut self, sink: Box<dyn Sink<EnrichedEvent>>) -> Self {
        self.enriched_sink = Some(sink);
        self
    }

    pub fn archive_sink(mut self, sink: Box<dyn Sink<EnrichedEvent>>) -> Self {
        self.archive_sink = Some(sink);
        self
    }

    pub fn metrics_sink(mut self, sink: Box<dyn Sink<WindowSummary>>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn late_sink(mut self, sink: Box<dyn Sink<LateEvent>>) -> Self {
        self.late_sink = Some(sink);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn start_from(mut self, start_from: StartOffset) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the scheduler's tick periods.
    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Restores the latest checkpoint and starts every task.
    pub async fn start(self) -> Result<PipelineHandle> {
        let Self {
            config,
            checkpoint,
            scheduler,
            readers,
            enriched_sink,
            archive_sink,
            metrics_sink,
            late_sink,
            store,
            start_from,
            retry,
        } = self;

        let missing = |what: &str| Error::config(format!("pipeline has no {}", what));
        let mut enriched_sink = enriched_sink.ok_or_else(|| missing("enriched sink"))?;
        let mut archive_sink = archive_sink.ok_or_else(|| missing("archive sink"))?;
        let mut metrics_sink = metrics_sink.ok_or_else(|| missing("metrics sink"))?;
        let mut late_sink = late_sink;
        let store = store.ok_or_else(|| missing("checkpoint store"))?;
        if readers.is_empty() {
            return Err(missing("source partitions"));
        }

        let restored = load_restore_point(store.as_ref()).await?;
        let restored_id = restored.as_ref().map(|r| r.checkpoint_id);
        match restored {
            Some(ref record) => info!(
                checkpoint_id = record.checkpoint_id,
                partitions = record.offsets.len(),
                open_windows = record.open_window_count(),
                watermark = %record.watermark,
                "Restoring from checkpoint"
            ),
            None => info!(start_from = ?start_from, "No checkpoint found, starting fresh"),
        }
        let restored = restored.unwrap_or_else(|| CheckpointRecord::empty(0));

        enriched_sink.recover(restored_id).await?;
        archive_sink.recover(restored_id).await?;
        metrics_sink.recover(restored_id).await?;
        if let Some(ref mut late) = late_sink {
            late.recover(restored_id).await?;
        }

        let settings = config.sink_settings();
        let mut sink_tasks = Vec::new();
        let (worker, enriched) = SinkWorker::new(SinkKind::Enriched, enriched_sink, settings);
        sink_tasks.push(worker.spawn());
        let (worker, archive) = SinkWorker::new(SinkKind::Archive, archive_sink, settings);
        sink_tasks.push(worker.spawn());
        let (worker, metrics_handle) = SinkWorker::new(SinkKind::Metrics, metrics_sink, settings);
        sink_tasks.push(worker.spawn());
        let late = late_sink.map(|sink| {
            let (worker, handle) = SinkWorker::new(SinkKind::Late, sink, settings);
            sink_tasks.push(worker.spawn());
            handle
        });
        let router = SinkRouter {
            enriched,
            archive,
            metrics: metrics_handle,
            late,
        };

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let shard_count = config.aggregator_shards.max(1);
        let mut windows_by_shard: Vec<Vec<WindowAccumulator>> = (0..shard_count).map(|_| Vec::new()).collect();
        for acc in restored.windows {
            windows_by_shard[shard_for(&acc.building, shard_count)].push(acc);
        }

        let mut shards = Vec::with_capacity(shard_count);
        let mut shard_tasks = Vec::with_capacity(shard_count);
        for (id, windows) in windows_by_shard.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            let mut aggregator = WindowAggregator::new(config.window_size_ms());
            aggregator.restore(restored.watermark, windows);
            let shard = AggregatorShard::new(
                id,
                aggregator,
                rx,
                router.metrics.clone(),
                router.late.clone(),
                fatal_tx.clone(),
            );
            shard_tasks.push(shard.spawn());
            shards.push(tx);
        }

        let tracker = WatermarkTracker::new(
            Duration::from_millis(config.bounded_lateness_ms),
            config.idle_timeout(),
        );
        for reader in &readers {
            let partition = reader.partition();
            match restored.partition_event_time.get(&partition) {
                Some(&event_ms) => tracker.seed(partition, event_ms),
                None => tracker.register(partition),
            }
        }

        let ctx = Arc::new(IngestContext {
            gate: RwLock::new(()),
            offsets: PartitionOffsets::new(),
            tracker,
            watermark: WatermarkHandle::starting_at(restored.watermark),
            enricher: FeatureEnricher::new(),
            router,
            shards,
            max_fetch_batch: config.max_fetch_batch.max(1),
        });
        if !restored.watermark.is_min() {
            health().pipeline.set_watermark(restored.watermark.timestamp_ms());
        }

        let coordinator = Arc::new(CheckpointCoordinator::new(
            ctx.clone(),
            store,
            checkpoint.timeout(),
            restored_id,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let partitions: Vec<i32> = readers.iter().map(|r| r.partition()).collect();
        let partition_tasks: Vec<JoinHandle<()>> = readers
            .into_iter()
            .map(|reader| {
                let partition = reader.partition();
                PartitionSupervisor {
                    ctx: ctx.clone(),
                    reader,
                    resume_from: restored.offsets.get(&partition).copied(),
                    start_from,
                    retry,
                    max_restarts: config.max_partition_restarts,
                    stop: stop_rx.clone(),
                }
                .spawn(fatal_tx.clone())
            })
            .collect();

        let (scheduler_stop_tx, scheduler_stop_rx) = watch::channel(false);
        let scheduler_tasks =
            Scheduler::new(scheduler, coordinator.clone(), ctx.clone()).start(scheduler_stop_rx);

        health().source.set_healthy();
        health().checkpoint.set_healthy();
        health().pipeline.mark_started();
        health().pipeline.set_consuming(true);
        info!(
            partitions = ?partitions,
            shards = shard_count,
            window_size_ms = config.window_size_ms(),
            bounded_lateness_ms = config.bounded_lateness_ms,
            "Pipeline started"
        );

        Ok(PipelineHandle {
            ctx: Some(ctx),
            coordinator: Some(coordinator),
            stop_tx,
            scheduler_stop_tx,
            partition_tasks,
            scheduler_tasks,
            shard_tasks,
            sink_tasks,
            fatal_rx: Mutex::new(fatal_rx),
        })
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    ctx: Option<Arc<IngestContext>>,
    coordinator: Option<Arc<CheckpointCoordinator>>,
    stop_tx: watch::Sender<bool>,
    scheduler_stop_tx: watch::Sender<bool>,
    partition_tasks: Vec<JoinHandle<()>>,
    scheduler_tasks: Vec<JoinHandle<()>>,
    shard_tasks: Vec<JoinHandle<()>>,
    sink_tasks: Vec<JoinHandle<()>>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<Error>>,
}

impl PipelineHandle {
    /// The published global watermark.
    pub fn current_watermark(&self) -> Watermark {
        self.ctx
            .as_ref()
            .map_or(Watermark::MIN, |ctx| ctx.watermark.current())
    }

    /// Next offsets per partition as of the last dispatched batches.
    pub fn offsets(&self) -> BTreeMap<i32, i64> {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.offsets.snapshot())
            .unwrap_or_default()
    }

    /// Takes a checkpoint now, waiting for one in flight to finish first.
    pub async fn checkpoint_now(&self) -> Result<u64> {
        match self.coordinator {
            Some(ref coordinator) => coordinator.checkpoint_now().await,
            None => Err(Error::internal("pipeline is shut down")),
        }
    }

    /// Resolves with the first fatal error. Pending forever while healthy.
    pub async fn wait(&self) -> Error {
        match self.fatal_rx.lock().await.recv().await {
            Some(e) => e,
            None => Error::internal("pipeline tasks exited"),
        }
    }

    /// Stops consumption, takes a final checkpoint and drains every stage.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Pipeline shutting down");
        let _ = self.stop_tx.send(true);
        for task in self.partition_tasks.drain(..) {
            let _ = task.await;
        }

        let _ = self.scheduler_stop_tx.send(true);
        for task in self.scheduler_tasks.drain(..) {
            let _ = task.await;
        }

        let final_checkpoint = match self.coordinator {
            Some(ref coordinator) => coordinator.checkpoint_now().await.map(|_| ()),
            None => Ok(()),
        };
        if let Err(ref e) = final_checkpoint {
            error!(error = %e, "Final checkpoint failed");
        }

        // Dropping the last senders lets shards, then sinks, drain and exit.
        self.coordinator = None;
        self.ctx = None;
        for task in self.shard_tasks.drain(..) {
            let _ = task.await;
        }
        for mut task in self.sink_tasks.drain(..) {
            if tokio::time::timeout(SINK_DRAIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Sink worker did not drain in time, aborting");
                task.abort();
            }
        }

        health().pipeline.set_consuming(false);
        info!("Pipeline stopped");
        final_checkpoint
    }
}
