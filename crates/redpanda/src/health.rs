//! Topic checks at start-up.

use std::collections::HashSet;

use rskafka::client::Client;
use tracing::{debug, error};

use crate::config::RedpandaConfig;

/// Returns the configured topics that do not exist. An unreachable broker
/// reports every topic as missing.
pub async fn missing_topics(client: &Client, config: &RedpandaConfig) -> Vec<String> {
    let mut wanted = vec![
        config.source.topic.clone(),
        config.sinks.enriched_topic.clone(),
        config.sinks.metrics_topic.clone(),
    ];
    wanted.extend(config.sinks.late_topic.clone());

    let existing: HashSet<String> = match client.list_topics().await {
        Ok(topics) => {
            debug!(topics = topics.len(), "Listed Redpanda topics");
            topics.into_iter().map(|t| t.name).collect()
        }
        Err(e) => {
            error!("Failed to list Redpanda topics: {}", e);
            HashSet::new()
        }
    };

    wanted
        .into_iter()
        .filter(|t| !existing.contains(t))
        .collect()
}
