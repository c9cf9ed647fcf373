//! Window aggregator.
//!
//! Keeps one accumulator per `(window_start, building)` in an ordered map.
//! Each accumulator goes `Open -> Closing -> Emitted` exactly once, when the
//! watermark reaches its window end, and is evicted after emission. Events
//! for a window that has already closed are returned as late and never
//! reopen it.
//!
//! Buildings are sharded across [`AggregatorShard`] tasks; every
//! accumulator is owned by exactly one task, so no locking is needed.

use std::collections::BTreeMap;

use pipeline_core::{
    millis_to_datetime, window_start, EnrichedEvent, Error, Ingest, LateEvent, Result, Watermark,
    WindowAccumulator, WindowKey, WindowState, WindowSummary,
};
use redpanda::partitioner::partition_hash;
use telemetry::metrics;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::router::SinkHandle;

#[derive(Debug, Clone)]
struct WindowSlot {
    state: WindowState,
    acc: WindowAccumulator,
}

/// Tumbling-window state machine of one shard.
#[derive(Debug)]
pub struct WindowAggregator {
    size_ms: i64,
    slots: BTreeMap<WindowKey, WindowSlot>,
    watermark: Watermark,
}

impl WindowAggregator {
    pub fn new(size_ms: i64) -> Self {
        Self {
            size_ms: size_ms.max(1),
            slots: BTreeMap::new(),
            watermark: Watermark::MIN,
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn open_window_count(&self) -> usize {
        self.slots.len()
    }

    /// Adds an event to its window, or returns it as late when that window
    /// has closed (`window_end <= watermark`).
    pub fn ingest(&mut self, event: EnrichedEvent) -> Ingest {
        let start_ms = window_start(event.event_time_ms(), self.size_ms);
        let end_ms = start_ms.saturating_add(self.size_ms);

        if !self.watermark.is_min() && end_ms <= self.watermark.timestamp_ms() {
            return Ingest::Late(Box::new(LateEvent {
                window_start: millis_to_datetime(start_ms).unwrap_or_default(),
                window_end: millis_to_datetime(end_ms).unwrap_or_default(),
                watermark: self.watermark.to_datetime().unwrap_or_default(),
                enriched: event,
            }));
        }

        let size_ms = self.size_ms;
        let mut opened = false;
        let slot = self
            .slots
            .entry(WindowKey::new(start_ms, event.building()))
            .or_insert_with_key(|key| {
                opened = true;
                WindowSlot {
                    state: WindowState::Open,
                    acc: WindowAccumulator::new(key, size_ms),
                }
            });
        slot.acc.add(&event);

        Ingest::Accepted { opened }
    }

    /// Closes and emits every window whose end the watermark has reached,
    /// in window order. A watermark that does not advance emits nothing.
    pub fn advance_watermark(&mut self, watermark: Watermark) -> Vec<WindowSummary> {
        if watermark <= self.watermark {
            return Vec::new();
        }
        self.watermark = watermark;

        let closed: Vec<WindowKey> = self
            .slots
            .iter()
            .take_while(|(_, slot)| slot.acc.window_end_ms <= watermark.timestamp_ms())
            .map(|(key, _)| key.clone())
            .collect();

        let mut summaries = Vec::with_capacity(closed.len());
        for key in closed {
            let Some(slot) = self.slots.remove(&key) else {
                continue;
            };
            match emit(slot) {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(e) => error!(building = %key.building, window_start = key.start_ms, error = %e, "Window not emitted"),
            }
        }
        summaries
    }

    /// Copies of the open accumulators, in window order.
    pub fn snapshot(&self) -> Vec<WindowAccumulator> {
        self.slots.values().map(|slot| slot.acc.clone()).collect()
    }

    /// Replaces the state with checkpointed accumulators.
    pub fn restore(&mut self, watermark: Watermark, windows: Vec<WindowAccumulator>) {
        self.watermark = watermark;
        self.slots = windows
            .into_iter()
            .map(|acc| {
                (
                    acc.key(),
                    WindowSlot {
                        state: WindowState::Open,
                        acc,
                    },
                )
            })
            .collect();
    }
}

fn emit(mut slot: WindowSlot) -> Result<Option<WindowSummary>> {
    slot.state = slot.state.transition(WindowState::Closing)?;
    let summary = slot.acc.summary();
    slot.state = slot.state.transition(WindowState::Emitted)?;
    debug!(building = %slot.acc.building, state = ?slot.state, count = slot.acc.count, "Window emitted");
    Ok(summary)
}

/// Shard owning the windows of `building` among `shards` shards.
pub fn shard_for(building: &str, shards: usize) -> usize {
    partition_hash(building, shards.max(1) as i32) as usize
}

/// Message to an aggregator shard, processed in arrival order.
#[derive(Debug)]
pub enum AggregatorMessage {
    Events(Vec<EnrichedEvent>),
    Watermark(Watermark),
    /// Reply with the open accumulators.
    Snapshot(oneshot::Sender<Vec<WindowAccumulator>>),
}

/// Task owning one [`WindowAggregator`].
pub struct AggregatorShard {
    id: usize,
    aggregator: WindowAggregator,
    rx: mpsc::Receiver<AggregatorMessage>,
    metrics_sink: SinkHandle<WindowSummary>,
    late_sink: Option<SinkHandle<LateEvent>>,
    fatal: mpsc::UnboundedSender<Error>,
}

impl AggregatorShard {
    pub fn new(
        id: usize,
        aggregator: WindowAggregator,
        rx: mpsc::Receiver<AggregatorMessage>,
        metrics_sink: SinkHandle<WindowSummary>,
        late_sink: Option<SinkHandle<LateEvent>>,
        fatal: mpsc::UnboundedSender<Error>,
    ) -> Self {
        Self {
            id,
            aggregator,
            rx,
            metrics_sink,
            late_sink,
            fatal,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the channel closes. Open windows are left in place; the
    /// final checkpoint has persisted them.
    pub async fn run(mut self) {
        metrics()
            .open_windows
            .add(self.aggregator.open_window_count() as i64);
        info!(
            shard = self.id,
            open_windows = self.aggregator.open_window_count(),
            watermark = %self.aggregator.watermark(),
            "Aggregator shard starting"
        );

        while let Some(message) = self.rx.recv().await {
            let result = match message {
                AggregatorMessage::Events(events) => self.ingest(events).await,
                AggregatorMessage::Watermark(watermark) => self.advance(watermark).await,
                AggregatorMessage::Snapshot(reply) => {
                    let _ = reply.send(self.aggregator.snapshot());
                    Ok(())
                }
            };

            if let Err(e) = result {
                error!(shard = self.id, error = %e, "Aggregator shard halted");
                let _ = self.fatal.send(e);
                break;
            }
        }

        metrics()
            .open_windows
            .sub(self.aggregator.open_window_count() as i64);
        info!(shard = self.id, "Aggregator shard stopped");
    }

    async fn ingest(&mut self, events: Vec<EnrichedEvent>) -> Result<()> {
        for event in events {
            match self.aggregator.ingest(event) {
                Ingest::Accepted { opened: true } => {
                    metrics().windows_opened.inc();
                    metrics().open_windows.add(1);
                }
                Ingest::Accepted { opened: false } => {}
                Ingest::Late(late) => {
                    metrics().late_events.inc();
                    debug!(
                        sensor_id = %late.enriched.sensor_id(),
                        event_time = %late.enriched.event_time(),
                        window_end = %late.window_end,
                        watermark = %late.watermark,
                        "Late event"
                    );
                    if let Some(ref sink) = self.late_sink {
                        sink.send(*late).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn advance(&mut self, watermark: Watermark) -> Result<()> {
        for summary in self.aggregator.advance_watermark(watermark) {
            metrics().windows_emitted.inc();
            metrics().open_windows.sub(1);
            self.metrics_sink.send(summary).await?;
        }
        Ok(())
    }
}
