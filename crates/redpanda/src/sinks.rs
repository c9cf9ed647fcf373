//! Output stream sinks.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_core::{EnrichedEvent, LateEvent, Result, Sink, WindowSummary};

use crate::producer::{KeyedRecord, Producer};

/// A record that can be produced to an output topic.
pub trait StreamRecord: Send + Sync + 'static {
    fn key(&self) -> String;
    fn payload(&self) -> Result<Vec<u8>>;
}

/// Enriched stream: keyed by sensor id.
impl StreamRecord for EnrichedEvent {
    fn key(&self) -> String {
        self.sensor_id().to_string()
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_record())?)
    }
}

/// Metrics stream: keyed by building.
impl StreamRecord for WindowSummary {
    fn key(&self) -> String {
        self.building.clone()
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Late-data side channel: keyed by sensor id.
impl StreamRecord for LateEvent {
    fn key(&self) -> String {
        self.enriched.sensor_id().to_string()
    }

    fn payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_record())?)
    }
}

/// Sink producing JSON records to one topic.
pub struct StreamSink<T> {
    name: &'static str,
    topic: String,
    producer: Arc<Producer>,
    _record: PhantomData<fn(T)>,
}

impl<T: StreamRecord> StreamSink<T> {
    pub fn new(name: &'static str, topic: impl Into<String>, producer: Arc<Producer>) -> Self {
        Self {
            name,
            topic: topic.into(),
            producer,
            _record: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

pub type EnrichedStreamSink = StreamSink<EnrichedEvent>;
pub type MetricsStreamSink = StreamSink<WindowSummary>;
pub type LateDataSink = StreamSink<LateEvent>;

#[async_trait]
impl<T: StreamRecord> Sink<T> for StreamSink<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn write_batch(&mut self, records: &[T]) -> Result<()> {
        let keyed = records
            .iter()
            .map(|r| {
                Ok(KeyedRecord {
                    key: r.key(),
                    payload: r.payload()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.producer.publish(&self.topic, keyed).await?;
        Ok(())
    }
}
