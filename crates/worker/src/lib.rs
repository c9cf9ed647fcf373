//! Stream processing stages of the sensor pipeline.
//!
//! - Enrichment (per-event derived features)
//! - Aggregation (tumbling windows per building, sharded owning tasks)
//! - Router (bounded, batching per-sink workers)
//! - Ingest (one supervised worker per source partition)
//! - Checkpoint (periodic, non-overlapping state snapshots)
//! - Scheduler (checkpoint, watermark and metrics tickers)

pub mod aggregator;
pub mod batch;
pub mod checkpoint;
pub mod checkpoint_store;
pub mod enrichment;
pub mod ingest;
pub mod pipeline;
pub mod router;
pub mod scheduler;

pub use aggregator::{AggregatorMessage, WindowAggregator};
pub use checkpoint::{CheckpointConfig, CheckpointCoordinator};
pub use checkpoint_store::{CheckpointStore, FileCheckpointStore};
pub use enrichment::{enrich, enrich_at, FeatureEnricher};
pub use pipeline::{PipelineBuilder, PipelineConfig, PipelineHandle};
pub use router::{SinkHandle, SinkMessage, SinkRouter, SinkSettings, SinkWorker};
pub use scheduler::SchedulerConfig;
