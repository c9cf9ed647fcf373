//! Metrics, health and logging for the sensor pipeline.
//!
//! Metrics and health live in process-wide registries so every worker can
//! publish without threading handles through the pipeline.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
