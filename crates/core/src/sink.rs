//! Output sink abstraction.

use async_trait::async_trait;

use crate::error::Result;

/// A downstream output channel.
///
/// `flush` and `commit` arrive in-band, after every record routed before
/// the checkpoint they belong to. Sinks without a commit protocol keep the
/// default no-op implementations.
#[async_trait]
pub trait Sink<T: Send + Sync + 'static>: Send {
    /// Stable sink name, used for logs, metrics and health.
    fn name(&self) -> &'static str;

    /// Writes a batch. Errors are retried by the caller.
    async fn write_batch(&mut self, records: &[T]) -> Result<()>;

    /// Resolves output left by a previous run, given the restored
    /// checkpoint id.
    async fn recover(&mut self, _restored_checkpoint: Option<u64>) -> Result<()> {
        Ok(())
    }

    /// Makes everything written so far durable as part of `checkpoint_id`.
    async fn flush(&mut self, _checkpoint_id: u64) -> Result<()> {
        Ok(())
    }

    /// Publishes what was flushed for `checkpoint_id` once it is persisted.
    async fn commit(&mut self, _checkpoint_id: u64) -> Result<()> {
        Ok(())
    }
}
