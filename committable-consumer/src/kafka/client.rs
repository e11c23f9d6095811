use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::kafka::types::{ConsumerRecord, Partition};

/// Offsets to acknowledge, keyed by partition. Values are the next offset to resume
/// reading from, i.e. the last consumed offset + 1.
pub type CommitOffsets = HashMap<Partition, i64>;

/// Invoked exactly once per `commit_async` call, possibly from another thread.
pub type CommitCallback = Box<dyn FnOnce(Result<CommitOffsets, ClientError>) + Send + 'static>;

/// The poll-driven client a consumer stage adapts into a stream.
///
/// A stage owns its client exclusively and only calls it from the stage task:
/// `poll` is never called after `close`, and `close` is called exactly once.
#[async_trait]
pub trait ConsumerClient: Send + 'static {
    /// Fetch the next batch of records, waiting at most `timeout` for the first one.
    /// An empty batch is a normal outcome.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, ClientError>;

    /// Start an asynchronous acknowledgment of `offsets` and report the outcome
    /// through `callback`.
    fn commit_async(&mut self, offsets: CommitOffsets, callback: CommitCallback);

    /// Release the client. No calls follow.
    fn close(&mut self);
}
