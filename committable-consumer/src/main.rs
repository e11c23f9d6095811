use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use committable_consumer::config::Config;
use committable_consumer::kafka::{
    commit_in_batches, committable_source, CommittableMessage, Control, KafkaConsumerClient,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Stop the stage on the first SIGINT or SIGTERM
fn spawn_signal_handler(control: Control) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        control.stop().await;
        info!("Consumer stopped, committing remaining offsets");
    });

    Ok(())
}

fn log_message(message: &CommittableMessage) {
    let record = message.record();
    debug!(
        topic = record.topic(),
        partition = record.partition_number(),
        offset = record.offset(),
        payload_bytes = record.payload_len(),
        "Consumed message"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting committable consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Serving metrics on {}", metrics_addr);

    let settings = config.consumer_settings();
    let client = KafkaConsumerClient::new(
        &config.client_config(&settings),
        &config.kafka_consumer_topic,
    )
    .with_context(|| {
        format!(
            "Failed to create Kafka consumer for topic {}",
            config.kafka_consumer_topic
        )
    })?
    .with_max_poll_records(config.max_poll_records);

    let (source, control) = committable_source(client, settings);
    spawn_signal_handler(control.clone())?;

    let offsets = source.filter_map(|message| async move {
        match message {
            Ok(message) => {
                log_message(&message);
                Some(message.into_offset())
            }
            Err(e) => {
                error!(error = ?e, "Consumer stream failed");
                None
            }
        }
    });

    let mut committed = Box::pin(commit_in_batches(offsets, config.commit_batch_size));
    let mut total = 0;
    while let Some(result) = committed.next().await {
        match result {
            Ok(batch) => {
                total += batch.len();
                debug!(partitions = batch.len(), "Committed offset batch");
            }
            Err(e) => warn!(error = ?e, "Offset batch commit failed"),
        }
    }
    drop(committed);
    info!(partition_commits = total, "Consumer stream completed");

    match tokio::time::timeout(config.shutdown_timeout(), control.shutdown()).await {
        Ok(()) => info!("Consumer shut down cleanly"),
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Timed out waiting for consumer shutdown"
        ),
    }

    Ok(())
}
