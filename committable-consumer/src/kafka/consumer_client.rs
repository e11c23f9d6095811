use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use crate::kafka::client::{CommitCallback, CommitOffsets, ConsumerClient};
use crate::kafka::metrics_consts::KAFKA_CLIENT_ERROR;
use crate::kafka::types::ConsumerRecord;

pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// [`ConsumerClient`] over an rdkafka [`StreamConsumer`] subscribed to one topic.
///
/// A poll waits up to its timeout for the first message, then takes whatever else
/// librdkafka already has queued, up to `max_poll_records`. Commits run the
/// synchronous rdkafka commit on the blocking pool and report through the callback.
pub struct KafkaConsumerClient {
    consumer: Option<Arc<StreamConsumer>>,
    topic: String,
    max_poll_records: usize,
    // fatal error seen while draining a poll that already had records
    deferred_error: Option<ClientError>,
}

impl KafkaConsumerClient {
    pub fn new(config: &ClientConfig, topic: &str) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = config.create()?;
        consumer.subscribe(&[topic])?;

        info!(topic = topic, "Subscribed Kafka consumer");

        Ok(Self {
            consumer: Some(Arc::new(consumer)),
            topic: topic.to_string(),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            deferred_error: None,
        })
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, ClientError> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e);
        }
        let consumer = self.consumer.clone().ok_or(ClientError::Closed)?;

        let first = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_elapsed) => return Ok(vec![]),
            Ok(Ok(message)) => ConsumerRecord::from(&message),
            Ok(Err(e)) => {
                return match classify_kafka_error(e) {
                    Some(fatal) => Err(fatal),
                    None => Ok(vec![]),
                }
            }
        };

        let mut records = Vec::with_capacity(self.max_poll_records.min(64));
        records.push(first);

        while records.len() < self.max_poll_records {
            match consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(ConsumerRecord::from(&message)),
                Some(Err(e)) => {
                    self.deferred_error = classify_kafka_error(e);
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    fn commit_async(&mut self, offsets: CommitOffsets, callback: CommitCallback) {
        let Some(consumer) = self.consumer.clone() else {
            callback(Err(ClientError::Closed));
            return;
        };

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in &offsets {
            if let Err(e) = list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            ) {
                callback(Err(e.into()));
                return;
            }
        }

        tokio::task::spawn_blocking(move || {
            let result = consumer
                .commit(&list, CommitMode::Sync)
                .map(|_| offsets)
                .map_err(ClientError::from);
            callback(result);
        });
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!(topic = self.topic.as_str(), "Closed Kafka consumer");
        }
    }
}

/// Sort a consumer error into transient ones, logged and treated as an empty poll,
/// and fatal ones returned to the stage.
fn classify_kafka_error(e: KafkaError) -> Option<ClientError> {
    match &e {
        KafkaError::PartitionEOF(_) => {
            record_kafka_error("info", "partition_eof");
            None
        }
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => {
                record_kafka_error("info", "partition_eof");
                None
            }
            RDKafkaErrorCode::OperationTimedOut => {
                record_kafka_error("info", "op_timed_out");
                None
            }
            RDKafkaErrorCode::OffsetOutOfRange => {
                // auto.offset.reset seeks to head or tail with the broker
                warn!("Offset out of range - seeking to configured offset reset policy");
                record_kafka_error("info", "offset_out_of_range");
                None
            }
            _ => {
                warn!("Kafka consumer error: {code:?}");
                record_kafka_error("warn", "consumer");
                None
            }
        },
        KafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            record_kafka_error("fatal", "consumer");
            Some(e.into())
        }
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                warn!("Broker connection issue: {code:?} - waiting for reconnect");
                record_kafka_error("warn", "broker_transport");
                None
            }
            RDKafkaErrorCode::Authentication => {
                error!("Authentication failed: {code:?}");
                record_kafka_error("fatal", "authentication");
                Some(e.into())
            }
            _ => {
                warn!("Global Kafka error: {code:?}");
                record_kafka_error("warn", "global");
                None
            }
        },
        KafkaError::Canceled => {
            info!("Consumer canceled");
            record_kafka_error("info", "canceled");
            Some(e.into())
        }
        _ => {
            error!("Unexpected Kafka error: {e:?}");
            record_kafka_error("fatal", "unexpected");
            Some(e.into())
        }
    }
}

fn record_kafka_error(level: &'static str, kind: &'static str) {
    metrics::counter!(KAFKA_CLIENT_ERROR, "level" => level, "error" => kind).increment(1);
}
