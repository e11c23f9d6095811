//! Consumer stage - adapts a poll-driven client into a backpressured stream.
//!
//! Each stage runs as one tokio task that owns the client, the buffer of polled but
//! undelivered messages, and the lifecycle state. Downstream demand is the free
//! capacity of a bounded output channel: the stage polls only when it holds a
//! reserved slot and its buffer is empty, so a slow consumer never makes it poll.
//!
//! Lifecycle: `Running -> Stopping -> Stopped -> ShuttingDown -> Shutdown`.
//! Stopping ends polling and moves the buffer into the output channel, then closes
//! the sending side. The stream ends once the consumer has received what is queued.
//! The client stays open in `Stopped` so offsets can still be committed. Shutting
//! down waits for every in-flight commit before closing the client.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::error::{ClientError, ConsumerError};
use crate::kafka::client::{CommitOffsets, ConsumerClient};
use crate::kafka::commit_executor::{CommitExecutor, StageCommand};
use crate::kafka::committable::{CommittableMessage, CommittableOffset};
use crate::kafka::control::Control;
use crate::kafka::metrics_consts::{
    COMMITS_SUBMITTED, CONSUMER_POLL_BATCH_SIZE, CONSUMER_POLL_FAILURES,
    CONSUMER_RECORDS_POLLED, CONSUMER_STAGE_TRANSITIONS,
};
use crate::kafka::types::{ConsumerRecord, PartitionOffset};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

type StageOutput = Result<CommittableMessage, ConsumerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageState {
    /// Polling on demand
    Running,
    /// No more polls, flushing buffered messages downstream
    Stopping,
    /// Output channel closed, client still open for commits
    Stopped,
    /// Waiting for in-flight commits before closing the client
    ShuttingDown,
    /// Client closed, commits rejected
    Shutdown,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Running => "running",
            StageState::Stopping => "stopping",
            StageState::Stopped => "stopped",
            StageState::ShuttingDown => "shutting_down",
            StageState::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    client_id: String,
    poll_timeout: Duration,
    buffer_size: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            client_id: format!("consumer-{}", Uuid::now_v7()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ConsumerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of the stage. Offsets are grouped by client id when batched, so it
    /// must be unique among stages whose offsets end up in the same batch.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Upper bound on a single poll, and so on how long lifecycle commands wait
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Messages that may sit between the stage and its consumer. At least 1.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Stream of committable messages produced by a stage. Dropping it cancels the
/// stage: polling stops and the client is closed once pending commits resolve.
#[derive(Debug)]
pub struct CommittableSource {
    receiver: mpsc::Receiver<StageOutput>,
}

impl Stream for CommittableSource {
    type Item = Result<CommittableMessage, ConsumerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Stream of bare records, offsets are not exposed
pub type PlainSource = BoxStream<'static, Result<ConsumerRecord, ConsumerError>>;

/// Start a stage over `client` and return its output stream and control handle.
///
/// Must be called from within a tokio runtime.
pub fn committable_source<C: ConsumerClient>(
    client: C,
    settings: ConsumerSettings,
) -> (CommittableSource, Control) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::channel(settings.buffer_size());
    let (state_tx, state_rx) = watch::channel(StageState::Running);

    let client_id = settings.client_id().to_string();
    let executor = CommitExecutor::new(client_id.clone(), command_tx.clone());

    let stage = ConsumerStage {
        client,
        settings,
        executor,
        commands: command_rx,
        buffer: VecDeque::new(),
        state: state_tx,
        shutdown_requested: false,
    };

    let span = info_span!("consumer_stage", client_id = %client_id);
    tokio::spawn(stage.run(output_tx).instrument(span));

    (
        CommittableSource {
            receiver: output_rx,
        },
        Control::new(client_id, command_tx, state_rx),
    )
}

/// Like [`committable_source`] for callers that never commit.
pub fn plain_source<C: ConsumerClient>(
    client: C,
    settings: ConsumerSettings,
) -> (PlainSource, Control) {
    let (source, control) = committable_source(client, settings);
    let records = source
        .map(|message| message.map(CommittableMessage::into_record))
        .boxed();
    (records, control)
}

struct ConsumerStage<C> {
    client: C,
    settings: ConsumerSettings,
    executor: CommitExecutor,
    commands: mpsc::UnboundedReceiver<StageCommand>,
    buffer: VecDeque<CommittableMessage>,
    state: watch::Sender<StageState>,
    // set by shutdown(), cancellation and poll failure
    shutdown_requested: bool,
}

impl<C: ConsumerClient> ConsumerStage<C> {
    async fn run(mut self, output: mpsc::Sender<StageOutput>) {
        info!("Consumer stage started");

        self.run_until_stopped(&output).await;
        drop(output);
        self.transition(StageState::Stopped);

        if !self.shutdown_requested {
            self.await_shutdown_request().await;
        }

        self.transition(StageState::ShuttingDown);
        self.drain_commits().await;

        self.client.close();
        self.transition(StageState::Shutdown);
    }

    async fn run_until_stopped(&mut self, output: &mpsc::Sender<StageOutput>) {
        while self.current_state() == StageState::Running {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv() => self.handle_command(command),

                permit = output.reserve() => match permit {
                    Ok(permit) => {
                        let polled = if self.buffer.is_empty() {
                            let records = self.client.poll(self.settings.poll_timeout()).await;
                            self.enqueue_polled(records)
                        } else {
                            Ok(())
                        };
                        match polled {
                            Ok(()) => {
                                if let Some(next) = self.buffer.pop_front() {
                                    permit.send(Ok(next));
                                }
                            }
                            Err(e) => permit.send(Err(e)),
                        }
                    }
                    Err(_) => self.on_cancelled(),
                },
            }
        }

        // stopping: no more polls, hand out what is already buffered
        while !self.buffer.is_empty() {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv() => self.handle_command(command),

                permit = output.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(next) = self.buffer.pop_front() {
                            permit.send(Ok(next));
                        }
                    }
                    Err(_) => {
                        debug!(
                            dropped = self.buffer.len(),
                            "Downstream cancelled while flushing buffer"
                        );
                        self.buffer.clear();
                        self.shutdown_requested = true;
                    }
                },
            }
        }
    }

    /// Buffer freshly polled records. A failed poll ends the stage: the error is the
    /// last element downstream sees, and the client is closed once commits drain.
    fn enqueue_polled(
        &mut self,
        polled: Result<Vec<ConsumerRecord>, ClientError>,
    ) -> Result<(), ConsumerError> {
        match polled {
            Ok(records) => {
                metrics::histogram!(CONSUMER_POLL_BATCH_SIZE).record(records.len() as f64);
                if records.is_empty() {
                    return Ok(());
                }
                metrics::counter!(CONSUMER_RECORDS_POLLED).increment(records.len() as u64);
                debug!(records = records.len(), "Polled records");

                for record in records {
                    let message = self.committable(record);
                    self.buffer.push_back(message);
                }
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "Poll failed, terminating consumer stage");
                metrics::counter!(CONSUMER_POLL_FAILURES).increment(1);
                self.shutdown_requested = true;
                self.transition(StageState::Stopping);
                Err(ConsumerError::Poll(e))
            }
        }
    }

    fn committable(&self, record: ConsumerRecord) -> CommittableMessage {
        let partition_offset = PartitionOffset::new(
            self.settings.client_id().to_string(),
            record.partition().clone(),
            record.offset(),
        );
        let offset = CommittableOffset::new(partition_offset, self.executor.clone());
        CommittableMessage::new(record, offset)
    }

    fn handle_command(&mut self, command: StageCommand) {
        match command {
            StageCommand::Commit { id, offsets } => self.issue_commit(id, offsets),
            StageCommand::Stop => self.begin_stopping(),
            StageCommand::Shutdown => {
                self.shutdown_requested = true;
                self.begin_stopping();
            }
        }
    }

    fn issue_commit(&mut self, id: u64, offsets: CommitOffsets) {
        debug!(commit_id = id, partitions = offsets.len(), "Issuing offset commit");
        metrics::counter!(COMMITS_SUBMITTED).increment(1);

        let executor = self.executor.clone();
        self.client.commit_async(
            offsets,
            Box::new(move |result| executor.complete(id, result.map(|_| ()))),
        );
    }

    fn begin_stopping(&mut self) {
        if self.current_state() == StageState::Running {
            self.transition(StageState::Stopping);
        }
    }

    fn on_cancelled(&mut self) {
        info!("Downstream cancelled, stopping consumer stage");
        self.shutdown_requested = true;
        self.begin_stopping();
    }

    async fn await_shutdown_request(&mut self) {
        while !self.shutdown_requested {
            match self.commands.recv().await {
                Some(command) => self.handle_command(command),
                // unreachable while the stage holds its own executor
                None => self.shutdown_requested = true,
            }
        }
    }

    async fn drain_commits(&mut self) {
        let pending = self.executor.pending_count();
        if pending > 0 {
            info!(pending = pending, "Waiting for in-flight commits");
        }

        while !self.executor.close_if_idle() {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv() => self.handle_command(command),

                _ = self.executor.await_all_pending() => {}
            }
        }
    }

    fn current_state(&self) -> StageState {
        *self.state.borrow()
    }

    fn transition(&self, next: StageState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                from = previous.as_str(),
                to = next.as_str(),
                "Consumer stage transition"
            );
            metrics::counter!(CONSUMER_STAGE_TRANSITIONS, "state" => next.as_str()).increment(1);
        }
    }
}
