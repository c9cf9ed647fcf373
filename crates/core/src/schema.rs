//! Decoding and validation of raw source records.

use validator::Validate;

use crate::constants::MAX_RECORD_BYTES;
use crate::error::{Error, Result};
use crate::events::{RawSensorEvent, SensorEvent};

/// Validates raw record size BEFORE deserialization.
pub fn validate_record_size(raw_bytes: &[u8]) -> Result<()> {
    if raw_bytes.len() > MAX_RECORD_BYTES {
        return Err(Error::corrupt(format!(
            "record {}KB exceeds {}KB limit",
            raw_bytes.len() / 1024,
            MAX_RECORD_BYTES / 1024
        )));
    }
    Ok(())
}

/// Validates a decoded event.
pub fn validate_event(event: &SensorEvent) -> Result<()> {
    event
        .validate()
        .map_err(|e| Error::corrupt(format!("{}: {}", event.sensor_id, e)))
}

/// Decodes one source record into a validated [`SensorEvent`].
///
/// Every failure maps to [`Error::CorruptRecord`]; the caller counts it and
/// moves past the record.
pub fn decode_sensor_event(raw_bytes: &[u8]) -> Result<SensorEvent> {
    validate_record_size(raw_bytes)?;

    let raw: RawSensorEvent = serde_json::from_slice(raw_bytes)
        .map_err(|e| Error::corrupt(format!("invalid json: {}", e)))?;

    let event = SensorEvent::try_from(raw)?;
    validate_event(&event)?;

    Ok(event)
}
