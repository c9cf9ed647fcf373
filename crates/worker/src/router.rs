//! Sink router.
//!
//! Every sink runs behind its own bounded channel and [`SinkWorker`] task,
//! so a slow sink backs up only its own producers. A producer that cannot
//! enqueue within the send timeout gets `SinkUnavailable`.
//!
//! Checkpoint flush and commit requests travel through the same channels as
//! records. A flush therefore covers exactly the records routed before it.

use std::time::{Duration, Instant};

use pipeline_core::{EnrichedEvent, Error, LateEvent, Result, Sink, WindowSummary};
use telemetry::{health, metrics, SinkKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::PendingBatch;

const MAX_WRITE_BACKOFF: Duration = Duration::from_secs(5);
const INITIAL_WRITE_BACKOFF: Duration = Duration::from_millis(100);

/// Message on a sink channel.
#[derive(Debug)]
pub enum SinkMessage<T> {
    Record(T),
    /// Write everything queued so far and make it durable.
    Flush {
        checkpoint_id: u64,
        ack: oneshot::Sender<Result<()>>,
    },
    /// The checkpoint is persisted; publish what was flushed for it.
    Commit { checkpoint_id: u64 },
}

/// Batching and retry settings of a sink worker.
#[derive(Debug, Clone, Copy)]
pub struct SinkSettings {
    pub capacity: usize,
    pub send_timeout: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            send_timeout: Duration::from_secs(30),
            batch_size: 500,
            batch_timeout: Duration::from_millis(200),
        }
    }
}

/// Producer side of a sink channel.
#[derive(Debug)]
pub struct SinkHandle<T> {
    kind: SinkKind,
    tx: mpsc::Sender<SinkMessage<T>>,
    send_timeout: Duration,
}

impl<T> Clone for SinkHandle<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            tx: self.tx.clone(),
            send_timeout: self.send_timeout,
        }
    }
}

impl<T: Send + Sync + 'static> SinkHandle<T> {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    /// Enqueues a record, waiting for buffer space up to the send timeout.
    pub async fn send(&self, record: T) -> Result<()> {
        self.enqueue(SinkMessage::Record(record)).await?;
        metrics().sink(self.kind).queue_depth.add(1);
        Ok(())
    }

    /// Requests a flush; the receiver resolves once the sink has flushed.
    pub async fn flush(&self, checkpoint_id: u64) -> Result<oneshot::Receiver<Result<()>>> {
        let (ack, rx) = oneshot::channel();
        self.enqueue(SinkMessage::Flush { checkpoint_id, ack }).await?;
        Ok(rx)
    }

    pub async fn commit(&self, checkpoint_id: u64) -> Result<()> {
        self.enqueue(SinkMessage::Commit { checkpoint_id }).await
    }

    async fn enqueue(&self, message: SinkMessage<T>) -> Result<()> {
        match self.tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                let msg = format!(
                    "buffer full for {} ms",
                    self.send_timeout.as_millis()
                );
                metrics().sink(self.kind).send_timeouts.inc();
                health().sink(self.kind).set_unhealthy(msg.clone());
                Err(Error::sink_unavailable(self.kind.as_str(), msg))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(Error::sink_unavailable(self.kind.as_str(), "sink worker stopped"))
            }
        }
    }
}

/// Consumer side of a sink channel: batches records and writes them.
pub struct SinkWorker<T: Send + Sync + 'static> {
    kind: SinkKind,
    sink: Box<dyn Sink<T>>,
    rx: mpsc::Receiver<SinkMessage<T>>,
    batch_size: usize,
    batch_timeout: Duration,
    /// Set once a batch was dropped; fails every later flush so no
    /// checkpoint moves past the lost records.
    lost: Option<String>,
}

impl<T: Send + Sync + 'static> SinkWorker<T> {
    /// Creates a worker and the handle feeding it.
    pub fn new(kind: SinkKind, sink: Box<dyn Sink<T>>, settings: SinkSettings) -> (Self, SinkHandle<T>) {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        let worker = Self {
            kind,
            sink,
            rx,
            batch_size: settings.batch_size.max(1),
            batch_timeout: settings.batch_timeout,
            lost: None,
        };
        let handle = SinkHandle {
            kind,
            tx,
            send_timeout: settings.send_timeout,
        };
        (worker, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until every handle is dropped, then writes what is left.
    pub async fn run(mut self) {
        info!(sink = self.sink.name(), "Sink worker starting");
        health().sink(self.kind).set_healthy();
        let mut pending = PendingBatch::new();

        loop {
            let message = match pending.deadline(self.batch_timeout) {
                Some(deadline) => tokio::select! {
                    message = self.rx.recv() => message,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        self.write(pending.take()).await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            let Some(message) = message else {
                break;
            };

            match message {
                SinkMessage::Record(record) => {
                    metrics().sink(self.kind).queue_depth.sub(1);
                    pending.push(record);
                    if pending.len() >= self.batch_size {
                        self.write(pending.take()).await;
                    }
                }
                SinkMessage::Flush { checkpoint_id, ack } => {
                    self.write(pending.take()).await;
                    let result = match self.lost {
                        Some(ref lost) => Err(Error::sink_write(self.kind.as_str(), lost.clone())),
                        None => self.sink.flush(checkpoint_id).await,
                    };
                    if let Err(ref e) = result {
                        warn!(sink = self.sink.name(), checkpoint_id, error = %e, "Sink flush failed");
                    }
                    // The coordinator may have given up waiting.
                    let _ = ack.send(result);
                }
                SinkMessage::Commit { checkpoint_id } => {
                    if let Err(e) = self.sink.commit(checkpoint_id).await {
                        error!(sink = self.sink.name(), checkpoint_id, error = %e, "Sink commit failed");
                    }
                }
            }
        }

        self.write(pending.take()).await;
        info!(sink = self.sink.name(), "Sink worker stopped");
    }

    /// Writes a batch, retrying transient failures with capped backoff.
    /// Other failures drop the batch and mark the sink as having lost
    /// records until the process restarts from the last checkpoint.
    async fn write(&mut self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let sink_metrics = metrics().sink(self.kind);
        let sink_health = health().sink(self.kind);
        let mut attempt: u32 = 0;

        loop {
            let start = Instant::now();
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    sink_metrics.write_latency_ms.observe_since(start);
                    sink_metrics.records_published.inc_by(batch.len() as u64);
                    if self.lost.is_none() && !sink_health.is_healthy() {
                        sink_health.set_healthy();
                    }
                    debug!(sink = self.sink.name(), count = batch.len(), "Wrote batch");
                    return;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    sink_metrics.write_errors.inc();
                    sink_health.set_unhealthy(e.to_string());

                    let backoff = INITIAL_WRITE_BACKOFF
                        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
                        .min(MAX_WRITE_BACKOFF);
                    warn!(
                        sink = self.sink.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    sink_metrics.write_errors.inc();
                    sink_health.set_unhealthy(e.to_string());
                    error!(
                        sink = self.sink.name(),
                        dropped = batch.len(),
                        error = %e,
                        "Sink write failed permanently, dropping batch"
                    );
                    if self.lost.is_none() {
                        self.lost = Some(format!("{} records dropped: {}", batch.len(), e));
                    }
                    return;
                }
            }
        }
    }
}

/// Handles of every output channel.
#[derive(Debug, Clone)]
pub struct SinkRouter {
    pub enriched: SinkHandle<EnrichedEvent>,
    pub archive: SinkHandle<EnrichedEvent>,
    pub metrics: SinkHandle<WindowSummary>,
    pub late: Option<SinkHandle<LateEvent>>,
}

impl SinkRouter {
    /// Sends an enriched event to the enriched stream and the archive.
    pub async fn route_enriched(&self, event: EnrichedEvent) -> Result<()> {
        self.enriched.send(event.clone()).await?;
        self.archive.send(event).await
    }

    /// Sends a commit to every sink. Failures are logged; the checkpoint
    /// is already persisted.
    pub async fn commit_all(&self, checkpoint_id: u64) {
        let results = [
            (SinkKind::Enriched, self.enriched.commit(checkpoint_id).await),
            (SinkKind::Archive, self.archive.commit(checkpoint_id).await),
            (SinkKind::Metrics, self.metrics.commit(checkpoint_id).await),
        ];
        for (kind, result) in results {
            if let Err(e) = result {
                warn!(sink = kind.as_str(), checkpoint_id, error = %e, "Commit request not delivered");
            }
        }
        if let Some(ref late) = self.late {
            if let Err(e) = late.commit(checkpoint_id).await {
                warn!(sink = late.kind().as_str(), checkpoint_id, error = %e, "Commit request not delivered");
            }
        }
    }
}
