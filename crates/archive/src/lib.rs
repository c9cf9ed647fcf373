//! Time-partitioned Parquet archive of enriched sensor events.

pub mod columnar;
pub mod config;
pub mod partition;
pub mod writer;

pub use config::ArchiveConfig;
pub use partition::PartitionKey;
pub use writer::{ArchiveWriter, RecoveryReport, SUCCESS_MARKER};
