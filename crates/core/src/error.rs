//! Unified error types for the sensor pipeline.
//!
//! Error codes:
//! - SRC_001: Source partition unavailable after retries
//! - SINK_001: Sink buffer saturated beyond the send timeout
//! - REC_001: Corrupt input record
//! - CKPT_001: Checkpoint could not be taken or persisted
//!
//! Late data is not an error. It is reported through
//! [`crate::window::Ingest::Late`] and the late-event counter.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coded failure classes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// SRC_001: source partition unreachable after bounded retries
    SourceUnavailable,
    /// SINK_001: sink could not accept records within the send timeout
    SinkUnavailable,
    /// REC_001: a single malformed input record
    CorruptRecord,
    /// CKPT_001: checkpoint attempt failed
    CheckpointFailure,
}

impl ErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable => "SRC_001",
            Self::SinkUnavailable => "SINK_001",
            Self::CorruptRecord => "REC_001",
            Self::CheckpointFailure => "CKPT_001",
        }
    }
}

/// Unified error type for the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A partition stayed unreachable after the retry budget was spent.
    #[error("[SRC_001] partition {partition} unavailable after {attempts} attempts: {message}")]
    SourceUnavailable {
        partition: i32,
        attempts: u32,
        message: String,
    },

    /// A transient fetch failure, retried by the source adapter.
    #[error("source fetch failed on partition {partition}: {message}")]
    SourceFetch { partition: i32, message: String },

    /// A sink buffer stayed full for longer than the configured timeout.
    #[error("[SINK_001] sink {sink} unavailable: {message}")]
    SinkUnavailable { sink: String, message: String },

    /// A sink write failed; the sink worker retries it.
    #[error("sink {sink} write failed: {message}")]
    SinkWrite { sink: String, message: String },

    /// A single input record could not be decoded or validated.
    #[error("[REC_001] corrupt record: {0}")]
    CorruptRecord(String),

    /// A checkpoint attempt failed. Processing continues.
    #[error("[CKPT_001] checkpoint failed: {0}")]
    CheckpointFailure(String),

    /// Invalid window state transition.
    #[error("invalid window transition: {0}")]
    WindowState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn source_unavailable(partition: i32, attempts: u32, msg: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            partition,
            attempts,
            message: msg.into(),
        }
    }

    pub fn source_fetch(partition: i32, msg: impl Into<String>) -> Self {
        Self::SourceFetch {
            partition,
            message: msg.into(),
        }
    }

    pub fn sink_unavailable(sink: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SinkUnavailable {
            sink: sink.into(),
            message: msg.into(),
        }
    }

    pub fn sink_write(sink: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SinkWrite {
            sink: sink.into(),
            message: msg.into(),
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptRecord(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::CheckpointFailure(msg.into())
    }

    pub fn parquet(msg: impl Into<String>) -> Self {
        Self::Parquet(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the coded class if this error belongs to the pipeline taxonomy.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::SourceUnavailable { .. } => Some(ErrorCode::SourceUnavailable),
            Self::SinkUnavailable { .. } => Some(ErrorCode::SinkUnavailable),
            Self::CorruptRecord(_) => Some(ErrorCode::CorruptRecord),
            Self::CheckpointFailure(_) => Some(ErrorCode::CheckpointFailure),
            _ => None,
        }
    }

    /// Whether this error halts the pipeline when it reaches the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::SinkUnavailable { .. } | Self::Internal(_)
        )
    }

    /// Whether the operation that produced this error should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceFetch { .. } | Self::SinkWrite { .. } | Self::Io(_)
        )
    }
}
