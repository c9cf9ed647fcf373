//! Enriched events and their output records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::SensorEvent;

/// Temperature trend category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TempTrend {
    Hot,
    Cold,
    Normal,
}

impl TempTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "HOT",
            Self::Cold => "COLD",
            Self::Normal => "NORMAL",
        }
    }
}

/// Humidity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HumidityCategory {
    High,
    Low,
    Moderate,
}

impl HumidityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::Moderate => "MODERATE",
        }
    }
}

/// A sensor event with its derived features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub event: SensorEvent,
    pub temp_trend: TempTrend,
    pub humidity_category: HumidityCategory,
    pub comfort_index: f64,
    pub anomaly_score: f64,
    /// Wall clock at enrichment
    pub processing_time: DateTime<Utc>,
}

impl EnrichedEvent {
    pub fn sensor_id(&self) -> &str {
        &self.event.sensor_id
    }

    pub fn building(&self) -> &str {
        &self.event.building
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event.event_time
    }

    pub fn event_time_ms(&self) -> i64 {
        self.event.event_time_ms()
    }

    /// Battery strictly below the low-battery threshold.
    pub fn is_low_battery(&self) -> bool {
        self.event
            .battery_level
            .is_some_and(|level| level < crate::constants::LOW_BATTERY_BELOW)
    }

    /// Output record for the enriched stream and archive.
    pub fn to_record(&self) -> ProcessedRecord {
        ProcessedRecord {
            sensor_id: self.event.sensor_id.clone(),
            event_time: self.event.event_time,
            temperature: self.event.temperature,
            humidity: self.event.humidity,
            pressure: self.event.pressure,
            temp_trend: self.temp_trend,
            humidity_category: self.humidity_category,
            comfort_index: self.comfort_index,
            anomaly_score: self.anomaly_score,
            is_anomaly: self.event.is_anomaly,
            processing_time: self.processing_time,
        }
    }
}

/// Flat enriched-stream record, keyed by sensor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub sensor_id: String,
    pub event_time: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub temp_trend: TempTrend,
    pub humidity_category: HumidityCategory,
    pub comfort_index: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub processing_time: DateTime<Utc>,
}

/// An event that arrived after its window closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateEvent {
    pub enriched: EnrichedEvent,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Watermark that rejected the event
    pub watermark: DateTime<Utc>,
}

impl LateEvent {
    pub fn to_record(&self) -> LateRecord {
        LateRecord {
            record: self.enriched.to_record(),
            window_start: self.window_start,
            window_end: self.window_end,
            watermark: self.watermark,
        }
    }
}

/// Late-data side channel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateRecord {
    #[serde(flatten)]
    pub record: ProcessedRecord,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
}
