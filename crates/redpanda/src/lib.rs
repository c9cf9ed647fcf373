//! Redpanda source adapter and output streams for the sensor pipeline.

pub mod client;
pub mod config;
pub mod health;
pub mod partitioner;
pub mod producer;
pub mod sinks;
pub mod source;
pub mod topics;

pub use client::{connect, topic_partitions};
pub use config::*;
pub use producer::*;
pub use sinks::*;
pub use source::*;
pub use topics::*;
