//! Broker connection setup.

use std::sync::Arc;

use pipeline_core::{Error, Result};
use rskafka::client::{Client, ClientBuilder, Credentials, SaslConfig};
use tracing::info;

use crate::config::RedpandaConfig;

/// Creates a TLS configuration for Redpanda Cloud.
fn create_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Connects to the configured brokers, with TLS and SASL when credentials
/// are present.
pub async fn connect(config: &RedpandaConfig) -> Result<Arc<Client>> {
    let mut builder = ClientBuilder::new(config.brokers.clone());

    if let Some((username, password)) = config.credentials() {
        builder = builder
            .tls_config(create_tls_config())
            .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                username.to_string(),
                password.to_string(),
            )));
    }

    let client = builder
        .build()
        .await
        .map_err(|e| Error::internal(format!("failed to connect to Redpanda: {}", e)))?;

    info!(
        brokers = %config.broker_string(),
        tls = config.credentials().is_some(),
        "Connected to Redpanda"
    );

    Ok(Arc::new(client))
}

/// Lists the partitions of a topic.
pub async fn topic_partitions(client: &Client, topic: &str) -> Result<Vec<i32>> {
    let topics = client
        .list_topics()
        .await
        .map_err(|e| Error::internal(format!("failed to list topics: {}", e)))?;

    let mut partitions: Vec<i32> = topics
        .into_iter()
        .find(|t| t.name == topic)
        .ok_or_else(|| Error::config(format!("topic {} does not exist", topic)))?
        .partitions
        .into_iter()
        .collect();
    partitions.sort_unstable();

    Ok(partitions)
}
