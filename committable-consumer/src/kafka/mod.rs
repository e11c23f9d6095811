// Kafka module - committable consumer stages over a poll-driven client
pub mod client;
pub mod commit_executor;
pub mod committable;
pub mod committer;
pub mod config;
pub mod consumer_client;
pub mod control;
pub mod metrics_consts;
pub mod stage;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use client::{CommitCallback, CommitOffsets, ConsumerClient};
pub use commit_executor::CommitExecutor;
pub use committable::{CommitHandle, CommittableMessage, CommittableOffset, CommittableOffsetBatch};
pub use committer::commit_in_batches;
pub use config::ConsumerConfigBuilder;
pub use consumer_client::KafkaConsumerClient;
pub use control::Control;
pub use stage::{
    committable_source, plain_source, CommittableSource, ConsumerSettings, PlainSource,
    StageState,
};
pub use types::{ConsumerRecord, Partition, PartitionOffset};
