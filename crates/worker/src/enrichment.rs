//! Per-event feature enrichment.
//!
//! Derives the temperature trend, humidity category, comfort index and
//! anomaly score of a sensor reading. The derivation uses fixed thresholds
//! and has no state, so replaying the same input yields the same features.

use chrono::{DateTime, Utc};
use pipeline_core::constants::{
    COMFORT_HUMIDITY, COMFORT_TEMPERATURE, HUMIDITY_HIGH_ABOVE, HUMIDITY_LOW_BELOW,
    NOMINAL_HUMIDITY, NOMINAL_PRESSURE, NOMINAL_TEMPERATURE, TEMP_COLD_BELOW, TEMP_HOT_ABOVE,
};
use pipeline_core::{EnrichedEvent, HumidityCategory, SensorEvent, TempTrend};
use telemetry::metrics;

pub fn temp_trend(temperature: f64) -> TempTrend {
    if temperature > TEMP_HOT_ABOVE {
        TempTrend::Hot
    } else if temperature < TEMP_COLD_BELOW {
        TempTrend::Cold
    } else {
        TempTrend::Normal
    }
}

pub fn humidity_category(humidity: f64) -> HumidityCategory {
    if humidity > HUMIDITY_HIGH_ABOVE {
        HumidityCategory::High
    } else if humidity < HUMIDITY_LOW_BELOW {
        HumidityCategory::Low
    } else {
        HumidityCategory::Moderate
    }
}

/// `100 - |t - 22| * 2 - |h - 45| * 0.5`
pub fn comfort_index(temperature: f64, humidity: f64) -> f64 {
    100.0
        - (temperature - COMFORT_TEMPERATURE).abs() * 2.0
        - (humidity - COMFORT_HUMIDITY).abs() * 0.5
}

/// Sum of relative deviations from the nominal reading.
pub fn anomaly_score(temperature: f64, humidity: f64, pressure: f64) -> f64 {
    (temperature - NOMINAL_TEMPERATURE).abs() / NOMINAL_TEMPERATURE
        + (humidity - NOMINAL_HUMIDITY).abs() / NOMINAL_HUMIDITY
        + (pressure - NOMINAL_PRESSURE).abs() / NOMINAL_PRESSURE
}

/// Enriches an event with an explicit processing time.
///
/// Deterministic: the same event and processing time always produce the
/// same output.
pub fn enrich_at(event: &SensorEvent, processing_time: DateTime<Utc>) -> EnrichedEvent {
    EnrichedEvent {
        event: event.clone(),
        temp_trend: temp_trend(event.temperature),
        humidity_category: humidity_category(event.humidity),
        comfort_index: comfort_index(event.temperature, event.humidity),
        anomaly_score: anomaly_score(event.temperature, event.humidity, event.pressure),
        processing_time,
    }
}

/// Enriches an event, stamping the current wall clock as processing time.
pub fn enrich(event: &SensorEvent) -> EnrichedEvent {
    enrich_at(event, Utc::now())
}

/// Enrichment stage used by the partition workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureEnricher;

impl FeatureEnricher {
    pub fn new() -> Self {
        Self
    }

    pub fn enrich(&self, event: &SensorEvent) -> EnrichedEvent {
        metrics().events_enriched.inc();
        enrich(event)
    }

    /// Enriches a batch in input order, sharing one processing time.
    pub fn enrich_batch(&self, events: &[SensorEvent]) -> Vec<EnrichedEvent> {
        let processing_time = Utc::now();
        metrics().events_enriched.inc_by(events.len() as u64);
        events
            .iter()
            .map(|event| enrich_at(event, processing_time))
            .collect()
    }
}
