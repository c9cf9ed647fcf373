//! Periodic pipeline tasks.

use std::sync::Arc;
use std::time::Duration;

use telemetry::metrics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointCoordinator;
use crate::ingest::IngestContext;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Checkpoint interval
    pub checkpoint_interval: Duration,
    /// Watermark recomputation for partitions that went quiet
    pub watermark_interval: Duration,
    /// Late-data and checkpoint-lag report interval
    pub report_interval: Duration,
    pub lag_alert_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            watermark_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(60),
            lag_alert_secs: 120.0,
        }
    }
}

/// Background tickers of a running pipeline.
pub struct Scheduler {
    config: SchedulerConfig,
    coordinator: Arc<CheckpointCoordinator>,
    ctx: Arc<IngestContext>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        coordinator: Arc<CheckpointCoordinator>,
        ctx: Arc<IngestContext>,
    ) -> Self {
        Self {
            config,
            coordinator,
            ctx,
        }
    }

    /// Starts all tickers. Each exits on the stop signal; the checkpoint
    /// ticker first waits for checkpoints it started.
    pub fn start(self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let handles = vec![
            tokio::spawn(run_checkpoints(
                self.coordinator.clone(),
                self.config.checkpoint_interval,
                stop.clone(),
            )),
            tokio::spawn(run_watermark_ticks(
                self.ctx.clone(),
                self.config.watermark_interval,
                stop.clone(),
            )),
            tokio::spawn(run_reports(
                self.config.report_interval,
                self.config.lag_alert_secs,
                stop,
            )),
        ];
        info!(
            checkpoint_interval_secs = self.config.checkpoint_interval.as_secs(),
            "Scheduler started"
        );
        handles
    }
}

async fn run_checkpoints(
    coordinator: Arc<CheckpointCoordinator>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                in_flight.retain(|handle| !handle.is_finished());
                let coordinator = coordinator.clone();
                // Overlapping ticks are counted as skipped by the coordinator.
                in_flight.push(tokio::spawn(async move {
                    let _ = coordinator.trigger().await;
                }));
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }
    debug!("Checkpoint ticker stopped");
}

async fn run_watermark_ticks(
    ctx: Arc<IngestContext>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let _gate = ctx.gate.read().await;
                if let Err(e) = ctx.publish_watermark().await {
                    warn!(error = %e, "Watermark publication failed");
                }
            }
        }
    }
    debug!("Watermark ticker stopped");
}

async fn run_reports(period: Duration, lag_alert_secs: f64, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut reported_late = metrics().late_events.get();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let snapshot = metrics().snapshot();
                info!(
                    events_consumed = snapshot.events_consumed,
                    events_enriched = snapshot.events_enriched,
                    corrupt_records = snapshot.corrupt_records,
                    windows_emitted = snapshot.windows_emitted,
                    open_windows = snapshot.open_windows,
                    late_events = snapshot.late_events,
                    late_data_rate = snapshot.late_data_rate,
                    checkpoint_lag_seconds = snapshot.checkpoint_lag_seconds,
                    "Pipeline report"
                );
                if snapshot.late_events > reported_late {
                    warn!(
                        new_late_events = snapshot.late_events - reported_late,
                        late_events = snapshot.late_events,
                        late_data_rate = snapshot.late_data_rate,
                        "Late events routed to the late-data path"
                    );
                    reported_late = snapshot.late_events;
                }
                if snapshot.checkpoint_lag_seconds > lag_alert_secs {
                    warn!(
                        checkpoint_lag_seconds = snapshot.checkpoint_lag_seconds,
                        lag_alert_secs,
                        "Checkpoint lag above alert threshold"
                    );
                }
            }
        }
    }
}
