//! Checkpoint coordinator.
//!
//! A checkpoint captures the source offsets, the open window accumulators
//! and the watermark at one consistent point: the ingestion gate is held
//! for writing while offsets are read and snapshot/flush requests are
//! enqueued, so every partition worker is between batches. Acknowledgements
//! are awaited after the gate is released, and the record is persisted
//! before sinks are told to commit.
//!
//! At most one checkpoint runs at a time. Failures are counted and leave
//! processing untouched; the next tick tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use pipeline_core::{CheckpointRecord, Error, Result};
use serde::{Deserialize, Serialize};
use telemetry::{health, metrics};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::aggregator::AggregatorMessage;
use crate::checkpoint_store::CheckpointStore;
use crate::ingest::IngestContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_dir")]
    pub dir: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound for one checkpoint cycle
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Checkpoint files kept on disk
    #[serde(default = "default_retained")]
    pub retained: usize,
    /// Lag beyond which health reports degraded
    #[serde(default = "default_lag_alert_secs")]
    pub lag_alert_secs: u64,
}

fn default_dir() -> String {
    "./data/checkpoints".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_retained() -> usize {
    3
}

fn default_lag_alert_secs() -> u64 {
    120
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            retained: default_retained(),
            lag_alert_secs: default_lag_alert_secs(),
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

pub struct CheckpointCoordinator {
    ctx: Arc<IngestContext>,
    store: Arc<dyn CheckpointStore>,
    timeout: Duration,
    next_id: AtomicU64,
    in_flight: Mutex<()>,
}

impl CheckpointCoordinator {
    /// `last_id` is the id of the restored checkpoint, if any.
    pub fn new(
        ctx: Arc<IngestContext>,
        store: Arc<dyn CheckpointStore>,
        timeout: Duration,
        last_id: Option<u64>,
    ) -> Self {
        Self {
            ctx,
            store,
            timeout,
            next_id: AtomicU64::new(last_id.map_or(1, |id| id + 1)),
            in_flight: Mutex::new(()),
        }
    }

    /// Runs a checkpoint unless one is already in flight, in which case
    /// the request is counted as skipped and `Ok(None)` returned.
    pub async fn trigger(&self) -> Result<Option<u64>> {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            metrics().checkpoints_skipped.inc();
            debug!("Checkpoint already in flight, skipping");
            return Ok(None);
        };
        self.run().await.map(Some)
    }

    /// Runs a checkpoint, waiting for one in flight to finish first.
    pub async fn checkpoint_now(&self) -> Result<u64> {
        let _in_flight = self.in_flight.lock().await;
        self.run().await
    }

    async fn run(&self) -> Result<u64> {
        let checkpoint_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.cycle(checkpoint_id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::checkpoint(format!(
                "timed out after {} ms",
                self.timeout.as_millis()
            ))),
        };

        match result {
            Ok(record) => {
                metrics().checkpoints_completed.inc();
                metrics().checkpoint_latency_ms.observe_since(start);
                health().checkpoint.set_healthy();
                health().pipeline.record_checkpoint(record.created_at);
                info!(
                    checkpoint_id,
                    partitions = record.offsets.len(),
                    open_windows = record.open_window_count(),
                    watermark = %record.watermark,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Checkpoint completed"
                );
                Ok(checkpoint_id)
            }
            Err(e) => {
                let e = match e {
                    Error::CheckpointFailure(_) => e,
                    other => Error::checkpoint(other.to_string()),
                };
                metrics().checkpoints_failed.inc();
                health().checkpoint.set_unhealthy(e.to_string());
                warn!(checkpoint_id, error = %e, "Checkpoint failed");
                Err(e)
            }
        }
    }

    async fn cycle(&self, checkpoint_id: u64) -> Result<CheckpointRecord> {
        let router = &self.ctx.router;

        let (offsets, partition_event_time, watermark, snapshots, mut flushes) = {
            let _gate = self.ctx.gate.write().await;

            let offsets = self.ctx.offsets.snapshot();
            let partition_event_time = self.ctx.tracker.partition_event_times();
            let watermark = self.ctx.watermark.current();

            let mut snapshots = Vec::with_capacity(self.ctx.shards.len());
            for shard in 0..self.ctx.shards.len() {
                let (reply, rx) = oneshot::channel();
                self.ctx
                    .send_to_shard(shard, AggregatorMessage::Snapshot(reply))
                    .await?;
                snapshots.push(rx);
            }

            let flushes = vec![
                router.enriched.flush(checkpoint_id).await?,
                router.archive.flush(checkpoint_id).await?,
            ];
            (offsets, partition_event_time, watermark, snapshots, flushes)
        };

        let mut windows = Vec::new();
        for rx in snapshots {
            let shard_windows = rx
                .await
                .map_err(|_| Error::checkpoint("aggregator shard dropped snapshot request"))?;
            windows.extend(shard_windows);
        }
        windows.sort_by(|a, b| a.key().cmp(&b.key()));

        // Summaries emitted before the snapshots are queued by now.
        flushes.push(router.metrics.flush(checkpoint_id).await?);
        if let Some(ref late) = router.late {
            flushes.push(late.flush(checkpoint_id).await?);
        }
        for rx in flushes {
            rx.await
                .map_err(|_| Error::checkpoint("sink dropped flush request"))??;
        }

        let record = CheckpointRecord {
            checkpoint_id,
            created_at: Utc::now(),
            offsets,
            partition_event_time,
            watermark,
            windows,
        };
        self.store.save(&record).await?;
        router.commit_all(checkpoint_id).await;

        Ok(record)
    }
}
