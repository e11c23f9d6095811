//! Commit executor - the only path from committable offsets to the client's
//! acknowledgment call.
//!
//! Every `submit()` registers a pending completion handle under a fresh commit id and
//! forwards the offsets to the owning stage task, which issues the `commit_async` call.
//! The client's callback resolves the handle and removes it from the registry, from
//! whatever thread it runs on. The stage closes the executor only when nothing is
//! pending, and once closed every further submit fails synchronously.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{ClientError, CommitError};
use crate::kafka::client::CommitOffsets;
use crate::kafka::metrics_consts::{
    COMMITS_COMPLETED, COMMITS_IN_FLIGHT, COMMITS_REJECTED_AFTER_SHUTDOWN,
};

/// Messages handled by a stage task
#[derive(Debug)]
pub(crate) enum StageCommand {
    Stop,
    Shutdown,
    Commit { id: u64, offsets: CommitOffsets },
}

/// Receiving end of a single commit record
pub(crate) type CommitReceiver = oneshot::Receiver<Result<(), CommitError>>;

struct CommitRegistry {
    closed: bool,
    next_commit_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<(), CommitError>>>,
}

// process-wide, so executors of stages sharing a client id stay distinguishable
static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

struct ExecutorInner {
    stage_id: u64,
    client_id: String,
    commands: mpsc::UnboundedSender<StageCommand>,
    registry: Mutex<CommitRegistry>,
    // woken whenever the last pending commit resolves
    idle: Notify,
}

/// Per-stage commit capability shared by every offset the stage hands out.
#[derive(Clone)]
pub struct CommitExecutor {
    inner: Arc<ExecutorInner>,
}

impl CommitExecutor {
    pub(crate) fn new(client_id: String, commands: mpsc::UnboundedSender<StageCommand>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                stage_id: NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed),
                client_id,
                commands,
                registry: Mutex::new(CommitRegistry {
                    closed: false,
                    next_commit_id: 1,
                    pending: HashMap::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Identity of the owning stage, unique even when client ids collide
    pub fn stage_id(&self) -> u64 {
        self.inner.stage_id
    }

    /// Register a commit and hand it to the stage task.
    ///
    /// Fails immediately with [`CommitError::StageShutdown`] once the stage has
    /// closed its client; the offsets are then never sent anywhere.
    pub(crate) fn submit(&self, offsets: CommitOffsets) -> Result<CommitReceiver, CommitError> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut registry = self.registry();
            if registry.closed {
                metrics::counter!(COMMITS_REJECTED_AFTER_SHUTDOWN).increment(1);
                return Err(self.shutdown_error());
            }
            let id = registry.next_commit_id;
            registry.next_commit_id += 1;
            registry.pending.insert(id, tx);
            self.record_in_flight(registry.pending.len());
            id
        };

        debug!(
            client_id = self.client_id(),
            commit_id = id,
            partitions = offsets.len(),
            "Submitting offset commit"
        );

        if self
            .inner
            .commands
            .send(StageCommand::Commit { id, offsets })
            .is_err()
        {
            // stage task is gone, nothing will ever issue this commit
            let mut registry = self.registry();
            registry.pending.remove(&id);
            self.record_in_flight(registry.pending.len());
            return Err(self.shutdown_error());
        }

        Ok(rx)
    }

    /// Resolve a commit record with the client's outcome. Safe to call from any thread.
    pub(crate) fn complete(&self, id: u64, result: Result<(), ClientError>) {
        let (sender, now_idle) = {
            let mut registry = self.registry();
            let sender = registry.pending.remove(&id);
            self.record_in_flight(registry.pending.len());
            (sender, registry.pending.is_empty())
        };

        match &result {
            Ok(()) => {
                debug!(
                    client_id = self.client_id(),
                    commit_id = id,
                    "Offset commit completed"
                );
                metrics::counter!(COMMITS_COMPLETED, "status" => "success").increment(1);
            }
            Err(e) => {
                warn!(
                    client_id = self.client_id(),
                    commit_id = id,
                    error = ?e,
                    "Offset commit failed"
                );
                metrics::counter!(COMMITS_COMPLETED, "status" => "failure").increment(1);
            }
        }

        match sender {
            Some(sender) => {
                if sender.send(result.map_err(CommitError::from)).is_err() {
                    debug!(
                        client_id = self.client_id(),
                        commit_id = id,
                        "Commit handle dropped before completion"
                    );
                }
            }
            None => {
                warn!(
                    client_id = self.client_id(),
                    commit_id = id,
                    "Completion for unknown commit"
                );
            }
        }

        if now_idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Number of commits submitted but not yet resolved
    pub fn pending_count(&self) -> usize {
        self.registry().pending.len()
    }

    /// Resolves once no commit is pending. New submits extend the wait.
    pub async fn await_all_pending(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.pending_count() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Close the executor if nothing is pending. Observing "no commits" and closing
    /// happen under the same lock so no submit can slip in between.
    pub(crate) fn close_if_idle(&self) -> bool {
        let mut registry = self.registry();
        if registry.pending.is_empty() {
            registry.closed = true;
        }
        registry.closed
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    fn shutdown_error(&self) -> CommitError {
        CommitError::StageShutdown {
            client_id: self.inner.client_id.clone(),
        }
    }

    fn record_in_flight(&self, pending: usize) {
        metrics::gauge!(COMMITS_IN_FLIGHT, "client_id" => self.inner.client_id.clone())
            .set(pending as f64);
    }

    fn registry(&self) -> MutexGuard<'_, CommitRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CommitExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitExecutor")
            .field("stage_id", &self.inner.stage_id)
            .field("client_id", &self.inner.client_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
