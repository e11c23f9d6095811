use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors reported by a [`ConsumerClient`](crate::kafka::client::ConsumerClient).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer client is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Outcome of a failed `commit()` on an offset or batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommitError {
    /// The underlying client rejected the acknowledgment.
    #[error("offset commit failed: {0}")]
    Client(#[from] ClientError),

    /// The owning stage already closed its client. Raised synchronously, the commit
    /// never reaches the client.
    #[error("consumer {client_id} is shut down, offsets can no longer be committed")]
    StageShutdown { client_id: String },

    /// The completion handle was dropped before the client reported back.
    #[error("consumer {client_id} dropped the commit before it completed")]
    Abandoned { client_id: String },
}

impl CommitError {
    pub fn is_stage_shutdown(&self) -> bool {
        matches!(self, CommitError::StageShutdown { .. })
    }
}

/// Terminal failure emitted as the last element of a consumer stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsumerError {
    #[error("poll failed: {0}")]
    Poll(#[source] ClientError),
}
