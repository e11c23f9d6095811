use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::stage::ConsumerSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "committable-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // generated per process when unset
    pub kafka_client_id: Option<String>,

    // Consumer stage configuration
    #[envconfig(default = "50")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "1000")]
    pub buffer_size: usize,

    #[envconfig(default = "100")]
    pub commit_batch_size: usize,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    // Prometheus exporter
    #[envconfig(default = "9102")]
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        let settings = ConsumerSettings::new()
            .with_poll_timeout(self.poll_timeout())
            .with_buffer_size(self.buffer_size);

        match &self.kafka_client_id {
            Some(client_id) => settings.with_client_id(client_id.as_str()),
            None => settings,
        }
    }

    /// rdkafka configuration for the consumer. Its `client.id` matches the stage's.
    pub fn client_config(&self, settings: &ConsumerSettings) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_client_id(settings.client_id())
            .build()
    }
}
