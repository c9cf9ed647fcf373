//! Common test setup functions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_core::{EnrichedEvent, LateEvent, WindowSummary};
use redpanda::{RetryPolicy, StartOffset};
use worker::{CheckpointConfig, PipelineBuilder, PipelineConfig, PipelineHandle, SchedulerConfig};

use crate::mocks::{CapturingSink, MemoryCheckpointStore, MemoryPartition};

/// Upper bound for any condition a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A pipeline over in-memory partitions, sinks and checkpoint store.
///
/// Checkpoints only run when a test asks for one; watermark ticks and sink
/// batches are fast so conditions settle within milliseconds. The harness
/// can start any number of pipelines in sequence over the same state to
/// exercise restore.
pub struct TestPipeline {
    pub partitions: Vec<MemoryPartition>,
    pub enriched: CapturingSink<EnrichedEvent>,
    pub archive: CapturingSink<EnrichedEvent>,
    pub metrics: CapturingSink<WindowSummary>,
    pub late: Option<CapturingSink<LateEvent>>,
    pub store: MemoryCheckpointStore,
    pub config: PipelineConfig,
    pub checkpoint: CheckpointConfig,
    pub retry: RetryPolicy,
}

impl TestPipeline {
    pub fn new(partitions: usize) -> Self {
        let config = PipelineConfig {
            aggregator_shards: 2,
            idle_timeout_secs: 0,
            sink_batch_timeout_ms: 10,
            sink_send_timeout_ms: 2_000,
            ..PipelineConfig::default()
        };
        let checkpoint = CheckpointConfig {
            interval_secs: 3_600,
            timeout_secs: 5,
            ..CheckpointConfig::default()
        };

        Self {
            partitions: (0..partitions as i32).map(MemoryPartition::new).collect(),
            enriched: CapturingSink::new("enriched"),
            archive: CapturingSink::new("archive"),
            metrics: CapturingSink::new("metrics"),
            late: Some(CapturingSink::new("late")),
            store: MemoryCheckpointStore::new(),
            config,
            checkpoint,
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
        }
    }

    /// Late events are only counted, not published.
    pub fn without_late_sink(mut self) -> Self {
        self.late = None;
        self
    }

    pub fn with_config(mut self, configure: impl FnOnce(&mut PipelineConfig)) -> Self {
        configure(&mut self.config);
        self
    }

    /// A builder wired to the harness state; tests may replace parts.
    pub fn builder(&self) -> PipelineBuilder {
        let mut builder = PipelineBuilder::new(self.config.clone(), self.checkpoint.clone())
            .partitions(self.partitions.iter().map(MemoryPartition::reader))
            .enriched_sink(self.enriched.boxed())
            .archive_sink(self.archive.boxed())
            .metrics_sink(self.metrics.boxed())
            .checkpoint_store(Arc::new(self.store.clone()))
            .start_from(StartOffset::Earliest)
            .retry(self.retry)
            .scheduler(SchedulerConfig {
                checkpoint_interval: Duration::from_secs(3_600),
                watermark_interval: Duration::from_millis(20),
                report_interval: Duration::from_secs(3_600),
                lag_alert_secs: 120.0,
            });
        if let Some(ref late) = self.late {
            builder = builder.late_sink(late.boxed());
        }
        builder
    }

    pub async fn start(&self) -> PipelineHandle {
        self.builder()
            .start()
            .await
            .expect("Failed to start pipeline")
    }

    pub fn late_sink(&self) -> &CapturingSink<LateEvent> {
        self.late.as_ref().expect("harness has no late sink")
    }
}

/// Polls `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Gives in-flight work a moment to show up before asserting its absence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
