//! Fixed constants of the enrichment and aggregation contract.
//!
//! The enrichment thresholds are part of the observable output of the
//! pipeline and are not configurable. Window size and bounded lateness are
//! defaults that the pipeline configuration may override.

// === Enrichment thresholds ===

/// Temperature above which an event is `HOT`.
pub const TEMP_HOT_ABOVE: f64 = 25.0;

/// Temperature below which an event is `COLD`.
pub const TEMP_COLD_BELOW: f64 = 18.0;

/// Humidity above which an event is `HIGH`.
pub const HUMIDITY_HIGH_ABOVE: f64 = 70.0;

/// Humidity below which an event is `LOW`.
pub const HUMIDITY_LOW_BELOW: f64 = 30.0;

/// Comfort index reference temperature.
pub const COMFORT_TEMPERATURE: f64 = 22.0;

/// Comfort index reference humidity.
pub const COMFORT_HUMIDITY: f64 = 45.0;

/// Anomaly score reference temperature.
pub const NOMINAL_TEMPERATURE: f64 = 22.0;

/// Anomaly score reference humidity.
pub const NOMINAL_HUMIDITY: f64 = 50.0;

/// Anomaly score reference pressure (hPa).
pub const NOMINAL_PRESSURE: f64 = 1013.0;

// === Aggregation ===

/// Battery level strictly below this counts as low battery.
pub const LOW_BATTERY_BELOW: i32 = 20;

/// Default tumbling window size (1 minute).
pub const DEFAULT_WINDOW_SIZE_MS: i64 = 60_000;

/// Default bounded lateness applied to the watermark (5 seconds).
pub const DEFAULT_BOUNDED_LATENESS_MS: i64 = 5_000;

// === Record limits ===

/// Maximum size of a single source record in bytes.
///
/// Sensor readings are a few hundred bytes; anything this large is garbage.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Maximum length of the sensor identifier.
///
/// The `#[validate]` derive needs literal values, so the same bound is
/// repeated on [`crate::events::SensorEvent`]. Keep both in sync.
pub const MAX_SENSOR_ID_LEN: usize = 128;
