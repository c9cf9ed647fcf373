//! Test fixtures and event generators.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Start of a window-aligned minute used as the time origin of tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

/// `t0()` plus `secs` seconds, in epoch milliseconds.
pub fn at_ms(secs: i64) -> i64 {
    (t0() + Duration::seconds(secs)).timestamp_millis()
}

/// A flat-form sensor reading at `t0() + secs`.
pub fn reading(sensor_id: &str, building: &str, secs: i64, temperature: f64) -> serde_json::Value {
    serde_json::json!({
        "sensor_id": sensor_id,
        "event_time": (t0() + Duration::seconds(secs)).to_rfc3339(),
        "temperature": temperature,
        "humidity": 45.0,
        "pressure": 1013.0,
        "is_anomaly": false,
        "building": building,
        "floor": 2,
        "room": "201",
        "battery_level": 80
    })
}

/// A reading flagged as anomalous by its producer.
pub fn anomalous(sensor_id: &str, building: &str, secs: i64, temperature: f64) -> serde_json::Value {
    let mut value = reading(sensor_id, building, secs, temperature);
    value["is_anomaly"] = serde_json::Value::Bool(true);
    value
}

/// The nested producer form of a reading.
pub fn nested_reading(sensor_id: &str, building: &str, secs: i64) -> serde_json::Value {
    serde_json::json!({
        "sensor_id": sensor_id,
        "timestamp": (t0() + Duration::seconds(secs)).to_rfc3339(),
        "temperature": 21.5,
        "humidity": 50.0,
        "pressure": 1010.0,
        "location": { "building": building, "floor": 1, "room": "101" },
        "device_info": { "model": "TH-200", "firmware_version": "1.4.2", "battery_level": 15 }
    })
}

pub fn encode(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

/// Payloads that fail decoding or validation.
pub fn corrupt_payloads() -> Vec<Vec<u8>> {
    vec![
        b"{not json".to_vec(),
        // Missing building
        br#"{"sensor_id":"s9","event_time":"2024-03-01T10:00:01Z","temperature":20.0,"humidity":40.0,"pressure":1000.0}"#.to_vec(),
        // Battery out of range
        br#"{"sensor_id":"s9","event_time":"2024-03-01T10:00:01Z","temperature":20.0,"humidity":40.0,"pressure":1000.0,"building":"B1","battery_level":140}"#.to_vec(),
    ]
}
