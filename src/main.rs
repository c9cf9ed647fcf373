//! Sensor Stream Pipeline
//!
//! Consumes sensor readings from Redpanda and:
//! - enriches each event with derived comfort and anomaly features
//! - publishes enriched events and archives them as hourly Parquet files
//! - aggregates per-building tumbling windows into a metrics stream
//! - checkpoints offsets and open windows for crash recovery

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

use api::{router, AppState};
use archive::{ArchiveConfig, ArchiveWriter};
use pipeline_core::{EnrichedEvent, LateEvent, Sink};
use redpanda::{
    connect, topic_partitions, EnrichedStreamSink, KafkaPartitionReader, LateDataSink,
    MetricsStreamSink, PartitionReader, Producer, RedpandaConfig, RetryPolicy,
};
use telemetry::{init_tracing, TracingConfig};
use worker::{CheckpointConfig, FileCheckpointStore, PipelineBuilder, PipelineConfig};

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Config {
    #[serde(default)]
    redpanda: RedpandaConfig,
    #[serde(default)]
    archive: ArchiveConfig,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    checkpoint: CheckpointConfig,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    logging: TracingConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23 needs a process-wide crypto provider before any TLS use.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    let config = load_config()?;
    init_tracing(&config.logging.clone().with_env_overrides());

    info!("Starting Sensor Pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!(
        brokers = ?config.redpanda.brokers,
        source_topic = %config.redpanda.source.topic,
        sasl_username = config.redpanda.sasl_username.as_deref().unwrap_or("none"),
        "Loaded Redpanda config"
    );

    let client = connect(&config.redpanda)
        .await
        .context("Failed to connect to Redpanda")?;

    let missing = redpanda::health::missing_topics(&client, &config.redpanda).await;
    if !missing.is_empty() {
        warn!(topics = ?missing, "Configured topics do not exist");
    }

    let partitions = if config.redpanda.source.partitions.is_empty() {
        topic_partitions(&client, &config.redpanda.source.topic)
            .await
            .context("Failed to discover source partitions")?
    } else {
        config.redpanda.source.partitions.clone()
    };
    info!(topic = %config.redpanda.source.topic, partitions = ?partitions, "Consuming partitions");

    let readers: Vec<Box<dyn PartitionReader>> = partitions
        .iter()
        .map(|&partition| {
            Box::new(KafkaPartitionReader::new(
                client.clone(),
                &config.redpanda.source,
                partition,
            )) as Box<dyn PartitionReader>
        })
        .collect();

    let producer = Arc::new(Producer::new(client.clone(), config.redpanda.compression()));
    let sinks = &config.redpanda.sinks;
    let late_sink = sinks.late_topic.as_ref().map(|topic| {
        Box::new(LateDataSink::new("late", topic.clone(), producer.clone())) as Box<dyn Sink<LateEvent>>
    });

    let store = Arc::new(FileCheckpointStore::new(
        &config.checkpoint.dir,
        config.checkpoint.retained,
    ));

    let mut builder = PipelineBuilder::new(config.pipeline.clone(), config.checkpoint.clone())
        .partitions(readers)
        .enriched_sink(Box::new(EnrichedStreamSink::new(
            "enriched",
            sinks.enriched_topic.clone(),
            producer.clone(),
        )) as Box<dyn Sink<EnrichedEvent>>)
        .archive_sink(Box::new(ArchiveWriter::new(&config.archive)))
        .metrics_sink(Box::new(MetricsStreamSink::new(
            "metrics",
            sinks.metrics_topic.clone(),
            producer.clone(),
        )))
        .checkpoint_store(store)
        .start_from(config.redpanda.source.start_from)
        .retry(RetryPolicy::from_config(&config.redpanda.source));
    if let Some(late_sink) = late_sink {
        builder = builder.late_sink(late_sink);
    }

    let pipeline = builder.start().await.context("Failed to start pipeline")?;

    let app = router(AppState::new(config.checkpoint.lag_alert_secs as f64));
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Health endpoint listening on http://{}", addr);

    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = server_stop_rx.await;
            })
            .await
    });

    let halted = tokio::select! {
        _ = shutdown_signal() => None,
        e = pipeline.wait() => Some(e),
    };
    if let Some(ref e) = halted {
        error!(error = %e, code = ?e.error_code(), "Pipeline halted");
    }

    info!("Shutting down...");
    if let Err(e) = pipeline.shutdown().await {
        error!("Shutdown did not complete cleanly: {}", e);
    }

    let _ = server_stop_tx.send(());
    match server.await {
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");

    match halted {
        Some(e) => Err(anyhow::Error::new(e).context("Pipeline halted")),
        None => Ok(()),
    }
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("PIPELINE")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // The config crate's nested parsing doesn't work reliably with underscored field names
    if let Ok(brokers) = std::env::var("PIPELINE_REDPANDA_BROKERS") {
        config.redpanda.brokers = brokers.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Ok(username) = std::env::var("PIPELINE_REDPANDA_SASL_USERNAME") {
        config.redpanda.sasl_username = Some(username);
    }
    if let Ok(password) = std::env::var("PIPELINE_REDPANDA_SASL_PASSWORD") {
        config.redpanda.sasl_password = Some(password);
    }
    if let Ok(topic) = std::env::var("PIPELINE_SOURCE_TOPIC") {
        config.redpanda.source.topic = topic;
    }
    if let Ok(root) = std::env::var("PIPELINE_ARCHIVE_ROOT") {
        config.archive.root = root.into();
    }
    if let Ok(dir) = std::env::var("PIPELINE_CHECKPOINT_DIR") {
        config.checkpoint.dir = dir;
    }

    Ok(config)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
