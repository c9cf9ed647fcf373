//! Tumbling window types.
//!
//! Windows are assigned by integer division of event time, so the same
//! event always lands in the same window regardless of arrival order.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::enriched::{EnrichedEvent, LateEvent};
use crate::error::{Error, Result};

/// Start of the tumbling window containing `event_ms`.
pub fn window_start(event_ms: i64, size_ms: i64) -> i64 {
    event_ms.div_euclid(size_ms) * size_ms
}

/// Key of one window accumulator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub start_ms: i64,
    pub building: String,
}

impl WindowKey {
    pub fn new(start_ms: i64, building: impl Into<String>) -> Self {
        Self {
            start_ms,
            building: building.into(),
        }
    }
}

/// Lifecycle of a window accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Open,
    Closing,
    Emitted,
}

impl WindowState {
    /// Applies a transition; only `Open -> Closing -> Emitted` is allowed.
    pub fn transition(self, next: WindowState) -> Result<WindowState> {
        match (self, next) {
            (Self::Open, Self::Closing) | (Self::Closing, Self::Emitted) => Ok(next),
            (from, to) => Err(Error::WindowState(format!("{:?} -> {:?}", from, to))),
        }
    }
}

/// Running aggregates of one (window, building) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub building: String,
    pub count: u64,
    pub sum_temperature: f64,
    pub sum_humidity: f64,
    pub sum_pressure: f64,
    pub anomaly_count: u64,
    pub low_battery_count: u64,
}

impl WindowAccumulator {
    pub fn new(key: &WindowKey, size_ms: i64) -> Self {
        Self {
            window_start_ms: key.start_ms,
            window_end_ms: key.start_ms + size_ms,
            building: key.building.clone(),
            count: 0,
            sum_temperature: 0.0,
            sum_humidity: 0.0,
            sum_pressure: 0.0,
            anomaly_count: 0,
            low_battery_count: 0,
        }
    }

    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.window_start_ms, self.building.clone())
    }

    pub fn add(&mut self, event: &EnrichedEvent) {
        self.count += 1;
        self.sum_temperature += event.event.temperature;
        self.sum_humidity += event.event.humidity;
        self.sum_pressure += event.event.pressure;
        if event.event.is_anomaly {
            self.anomaly_count += 1;
        }
        if event.is_low_battery() {
            self.low_battery_count += 1;
        }
    }

    /// Final metrics, `None` for an empty window.
    pub fn summary(&self) -> Option<WindowSummary> {
        if self.count == 0 {
            return None;
        }
        let count = self.count as f64;

        Some(WindowSummary {
            window_start: millis_to_datetime(self.window_start_ms)?,
            window_end: millis_to_datetime(self.window_end_ms)?,
            building: self.building.clone(),
            sensor_count: self.count as i64,
            avg_temperature: round_to(self.sum_temperature / count, 2),
            avg_humidity: round_to(self.sum_humidity / count, 2),
            avg_pressure: round_to(self.sum_pressure / count, 2),
            anomaly_count: self.anomaly_count as i64,
            anomaly_rate: round_to(self.anomaly_count as f64 / count, 3),
            low_battery_count: self.low_battery_count as i64,
        })
    }
}

/// Metrics-stream record of one emitted window, keyed by building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub building: String,
    pub sensor_count: i64,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub avg_pressure: f64,
    pub anomaly_count: i64,
    pub anomaly_rate: f64,
    pub low_battery_count: i64,
}

/// Outcome of offering an event to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// Aggregated; `opened` when the event created its window.
    Accepted { opened: bool },
    /// The event's window is already closed.
    Late(Box<LateEvent>),
}

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
