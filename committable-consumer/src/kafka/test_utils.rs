use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::kafka::client::{CommitCallback, CommitOffsets, ConsumerClient};
use crate::kafka::types::{ConsumerRecord, Partition};

/// Decides what happens to a `commit_async` call on the mock client
pub type CommitHandler = Arc<dyn Fn(CommitOffsets, CommitCallback) + Send + Sync>;

/// In-memory client with an enqueueable poll response queue.
///
/// Clones share state, so a test keeps one clone to drive and inspect the client
/// while the stage owns another. An empty queue makes `poll` wait out its timeout
/// and return nothing, like an idle topic.
#[derive(Clone)]
pub struct MockConsumerClient {
    state: Arc<MockState>,
}

struct MockState {
    responses: Mutex<VecDeque<Result<Vec<ConsumerRecord>, ClientError>>>,
    commits: Mutex<Vec<CommitOffsets>>,
    commit_handler: Mutex<CommitHandler>,
    poll_count: AtomicUsize,
    polls_after_close: AtomicUsize,
    close_count: AtomicUsize,
}

impl Default for MockConsumerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsumerClient {
    /// Mock whose commits succeed immediately
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                responses: Mutex::new(VecDeque::new()),
                commits: Mutex::new(vec![]),
                commit_handler: Mutex::new(succeed_commits()),
                poll_count: AtomicUsize::new(0),
                polls_after_close: AtomicUsize::new(0),
                close_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_commit_handler(self, handler: CommitHandler) -> Self {
        *self.state.commit_handler.lock().unwrap() = handler;
        self
    }

    /// Queue the result of one future poll
    pub fn enqueue(&self, records: Vec<ConsumerRecord>) {
        self.state.responses.lock().unwrap().push_back(Ok(records));
    }

    pub fn enqueue_error(&self, error: ClientError) {
        self.state.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn pending_responses(&self) -> usize {
        self.state.responses.lock().unwrap().len()
    }

    /// Offsets of every `commit_async` call, in call order
    pub fn commits(&self) -> Vec<CommitOffsets> {
        self.state.commits.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.commits.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> usize {
        self.state.poll_count.load(Ordering::SeqCst)
    }

    pub fn polls_after_close(&self) -> usize {
        self.state.polls_after_close.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl ConsumerClient for MockConsumerClient {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, ClientError> {
        self.state.poll_count.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            self.state.polls_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(ClientError::Closed);
        }

        let next = self.state.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(vec![])
            }
        }
    }

    fn commit_async(&mut self, offsets: CommitOffsets, callback: CommitCallback) {
        self.state.commits.lock().unwrap().push(offsets.clone());
        let handler = self.state.commit_handler.lock().unwrap().clone();
        handler(offsets, callback);
    }

    fn close(&mut self) {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Commit handler acknowledging every commit on the spot
pub fn succeed_commits() -> CommitHandler {
    Arc::new(|offsets: CommitOffsets, callback: CommitCallback| {
        callback(Ok(offsets))
    })
}

/// Commit handler failing every commit with `error`
pub fn fail_commits(error: ClientError) -> CommitHandler {
    Arc::new(move |_offsets: CommitOffsets, callback: CommitCallback| {
        callback(Err(error.clone()))
    })
}

/// Holds commit callbacks until the test decides how they complete
#[derive(Clone, Default)]
pub struct DeferredCommits {
    callbacks: Arc<Mutex<Vec<(CommitOffsets, CommitCallback)>>>,
}

impl DeferredCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> CommitHandler {
        let callbacks = self.callbacks.clone();
        Arc::new(move |offsets: CommitOffsets, callback: CommitCallback| {
            callbacks.lock().unwrap().push((offsets, callback));
        })
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acknowledge every held commit successfully, returns how many were completed
    pub fn succeed_all(&self) -> usize {
        self.complete_all(Ok)
    }

    pub fn fail_all(&self, error: ClientError) -> usize {
        self.complete_all(|_| Err(error.clone()))
    }

    fn complete_all<F>(&self, outcome: F) -> usize
    where
        F: Fn(CommitOffsets) -> Result<CommitOffsets, ClientError>,
    {
        let held: Vec<_> = self.callbacks.lock().unwrap().drain(..).collect();
        let count = held.len();
        for (offsets, callback) in held {
            callback(outcome(offsets));
        }
        count
    }
}

pub fn partition(topic: &str, partition_number: i32) -> Partition {
    Partition::new(topic.to_string(), partition_number)
}

pub fn record(topic: &str, partition_number: i32, offset: i64, value: &str) -> ConsumerRecord {
    ConsumerRecord::new(
        partition(topic, partition_number),
        offset,
        Some(format!("key-{offset}").into_bytes()),
        Some(value.as_bytes().to_vec()),
    )
}

/// `count` consecutive records on one partition starting at `first_offset`
pub fn records(
    topic: &str,
    partition_number: i32,
    first_offset: i64,
    count: usize,
) -> Vec<ConsumerRecord> {
    (0..count)
        .map(|i| {
            let offset = first_offset + i as i64;
            record(topic, partition_number, offset, &format!("value-{offset}"))
        })
        .collect()
}
