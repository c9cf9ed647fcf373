//! Sensor event definitions.
//!
//! [`SensorEvent`] is the validated, immutable record the rest of the
//! pipeline works with. [`RawSensorEvent`] mirrors what producers put on the
//! wire: either the flat attribute layout or the nested producer layout
//! with `location` and `device_info` objects.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};

/// Rejects NaN and infinite readings.
fn validate_reading(value: f64) -> std::result::Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        let mut err = ValidationError::new("non_finite_reading");
        err.message = Some("reading must be a finite number".into());
        Err(err)
    }
}

/// A single sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SensorEvent {
    /// Sensor identifier, also the source partition key
    #[validate(length(min = 1, max = 128))]
    pub sensor_id: String,
    /// Event time assigned by the sensor
    pub event_time: DateTime<Utc>,
    /// Temperature in degrees Celsius
    #[validate(custom(function = "validate_reading"))]
    pub temperature: f64,
    /// Relative humidity in percent
    #[validate(custom(function = "validate_reading"))]
    pub humidity: f64,
    /// Pressure in hPa
    #[validate(custom(function = "validate_reading"))]
    pub pressure: f64,
    /// Producer-asserted anomaly flag
    #[serde(default)]
    pub is_anomaly: bool,
    /// Building, the aggregation dimension
    #[validate(length(min = 1, max = 128))]
    pub building: String,
    pub floor: Option<i32>,
    pub room: Option<String>,
    /// Device model
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    /// Battery level in percent
    #[validate(range(min = 0, max = 100))]
    pub battery_level: Option<i32>,
}

impl SensorEvent {
    /// Event time in milliseconds since the epoch.
    pub fn event_time_ms(&self) -> i64 {
        self.event_time.timestamp_millis()
    }
}

/// Location block of the nested producer layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLocation {
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room: Option<String>,
}

/// Device block of the nested producer layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDeviceInfo {
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub battery_level: Option<i32>,
}

/// A sensor record as it appears on the wire.
///
/// Flat attributes win over the nested blocks when both are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSensorEvent {
    pub sensor_id: Option<String>,
    #[serde(alias = "timestamp")]
    pub event_time: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub is_anomaly: Option<bool>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub battery_level: Option<i32>,
    pub location: Option<RawLocation>,
    pub device_info: Option<RawDeviceInfo>,
}

impl TryFrom<RawSensorEvent> for SensorEvent {
    type Error = Error;

    fn try_from(raw: RawSensorEvent) -> Result<Self> {
        let location = raw.location.unwrap_or_default();
        let device = raw.device_info.unwrap_or_default();

        let event_time = raw
            .event_time
            .as_deref()
            .ok_or_else(|| Error::corrupt("missing field `event_time`"))
            .and_then(parse_event_time)?;

        Ok(Self {
            sensor_id: required(raw.sensor_id, "sensor_id")?,
            event_time,
            temperature: required(raw.temperature, "temperature")?,
            humidity: required(raw.humidity, "humidity")?,
            pressure: required(raw.pressure, "pressure")?,
            is_anomaly: raw.is_anomaly.unwrap_or(false),
            building: required(raw.building.or(location.building), "building")?,
            floor: raw.floor.or(location.floor),
            room: raw.room.or(location.room),
            model: raw.model.or(device.model),
            firmware_version: raw.firmware_version.or(device.firmware_version),
            battery_level: raw.battery_level.or(device.battery_level),
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::corrupt(format!("missing field `{}`", field)))
}

/// Parses an ISO-8601 event time.
///
/// Accepts RFC 3339 with an offset, and naive timestamps which are taken
/// as UTC.
pub fn parse_event_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(Error::corrupt(format!("invalid event_time `{}`", value)))
}
