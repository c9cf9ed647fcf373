//! Keyed JSON producer using rskafka.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use pipeline_core::{Error, Result};
use rskafka::client::{
    partition::{Compression, PartitionClient, UnknownTopicHandling},
    Client,
};
use rskafka::record::Record;
use tokio::sync::RwLock;
use tracing::debug;

use crate::client::topic_partitions;
use crate::partitioner::partition_hash;

/// A record ready to produce.
#[derive(Debug, Clone)]
pub struct KeyedRecord {
    pub key: String,
    pub payload: Vec<u8>,
}

/// Producer shared by the output stream sinks.
pub struct Producer {
    client: Arc<Client>,
    compression: Compression,
    /// Cached partition clients per (topic, partition)
    clients: RwLock<BTreeMap<(String, i32), Arc<PartitionClient>>>,
    /// Partition count per topic
    partition_counts: RwLock<BTreeMap<String, i32>>,
}

impl Producer {
    pub fn new(client: Arc<Client>, compression: Compression) -> Self {
        Self {
            client,
            compression,
            clients: RwLock::new(BTreeMap::new()),
            partition_counts: RwLock::new(BTreeMap::new()),
        }
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        if let Some(count) = self.partition_counts.read().await.get(topic) {
            return Ok(*count);
        }

        let count = topic_partitions(&self.client, topic)
            .await
            .map_err(|e| Error::sink_write(topic, e.to_string()))?
            .len() as i32;

        self.partition_counts
            .write()
            .await
            .insert(topic.to_string(), count);
        Ok(count)
    }

    async fn get_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>> {
        let key = (topic.to_string(), partition);

        if let Some(client) = self.clients.read().await.get(&key) {
            return Ok(client.clone());
        }

        let partition_client = self
            .client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| Error::sink_write(topic, format!("partition client: {}", e)))?;

        let partition_client = Arc::new(partition_client);
        self.clients
            .write()
            .await
            .insert(key, partition_client.clone());

        Ok(partition_client)
    }

    /// Drops cached clients so the next publish reconnects.
    pub async fn reset(&self) {
        self.clients.write().await.clear();
        self.partition_counts.write().await.clear();
    }

    /// Produces records, routing each by its key.
    pub async fn publish(&self, topic: &str, records: Vec<KeyedRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let count = self.partition_count(topic).await?;
        let mut by_partition: BTreeMap<i32, Vec<Record>> = BTreeMap::new();
        let now = Utc::now();

        for record in records {
            by_partition
                .entry(partition_hash(&record.key, count))
                .or_default()
                .push(Record {
                    key: Some(record.key.into_bytes()),
                    value: Some(record.payload),
                    headers: BTreeMap::new(),
                    timestamp: now,
                });
        }

        let mut sent = 0;
        for (partition, records) in by_partition {
            let client = self.get_client(topic, partition).await?;
            let len = records.len();

            if let Err(e) = client.produce(records, self.compression).await {
                self.reset().await;
                return Err(Error::sink_write(topic, format!("produce: {}", e)));
            }

            debug!(topic = %topic, partition, count = len, "Produced records");
            sent += len;
        }

        Ok(sent)
    }
}
