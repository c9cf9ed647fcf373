//! Topic names used by the pipeline.

pub mod topic {
    /// Raw sensor readings, keyed by sensor id
    pub const SENSOR_DATA: &str = "sensor-data";
    /// Enriched readings, keyed by sensor id
    pub const PROCESSED_SENSOR_DATA: &str = "processed-sensor-data";
    /// Per-building window summaries
    pub const SENSOR_METRICS: &str = "sensor-metrics";
    /// Events rejected by a closed window
    pub const SENSOR_LATE_DATA: &str = "sensor-late-data";
}
