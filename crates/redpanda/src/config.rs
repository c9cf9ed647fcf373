//! Redpanda configuration.

use rskafka::client::partition::Compression;
use serde::{Deserialize, Serialize};

use crate::topics::topic;

/// Redpanda connection, source and sink topic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    /// SASL/SCRAM-SHA-256 username; TLS is enabled when credentials are set
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    /// Compression type for produced records (none, gzip, snappy, lz4, zstd)
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sinks: SinkTopics,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for RedpandaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            sasl_username: None,
            sasl_password: None,
            compression: default_compression(),
            source: SourceConfig::default(),
            sinks: SinkTopics::default(),
        }
    }
}

impl RedpandaConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }

    /// SASL credentials when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.sasl_username, &self.sasl_password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn compression(&self) -> Compression {
        match self.compression.as_str() {
            "gzip" => Compression::Gzip,
            "snappy" => Compression::Snappy,
            "lz4" => Compression::Lz4,
            "zstd" => Compression::Zstd,
            _ => Compression::NoCompression,
        }
    }
}

/// Where a partition starts when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

/// Source topic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_topic")]
    pub topic: String,
    /// Partitions to consume; empty consumes every partition of the topic
    #[serde(default)]
    pub partitions: Vec<i32>,
    #[serde(default)]
    pub start_from: StartOffset,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: i32,
    /// Fetch retries before a partition is reported unavailable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_source_topic() -> String {
    topic::SENSOR_DATA.to_string()
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

fn default_fetch_max_wait_ms() -> i32 {
    500
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            topic: default_source_topic(),
            partitions: Vec::new(),
            start_from: StartOffset::default(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Output topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkTopics {
    #[serde(default = "default_enriched_topic")]
    pub enriched_topic: String,
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Late-data side channel; `None` counts and logs late events only
    #[serde(default = "default_late_topic")]
    pub late_topic: Option<String>,
}

fn default_enriched_topic() -> String {
    topic::PROCESSED_SENSOR_DATA.to_string()
}

fn default_metrics_topic() -> String {
    topic::SENSOR_METRICS.to_string()
}

fn default_late_topic() -> Option<String> {
    Some(topic::SENSOR_LATE_DATA.to_string())
}

impl Default for SinkTopics {
    fn default() -> Self {
        Self {
            enriched_topic: default_enriched_topic(),
            metrics_topic: default_metrics_topic(),
            late_topic: default_late_topic(),
        }
    }
}
