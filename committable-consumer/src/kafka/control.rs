use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::kafka::commit_executor::StageCommand;
use crate::kafka::stage::StageState;

/// Handle to a running consumer stage.
///
/// Every method is idempotent and may be called concurrently from any number of
/// clones. Calls made after the stage is already past the requested point resolve
/// immediately.
#[derive(Debug, Clone)]
pub struct Control {
    client_id: String,
    commands: mpsc::UnboundedSender<StageCommand>,
    state: watch::Receiver<StageState>,
}

impl Control {
    pub(crate) fn new(
        client_id: String,
        commands: mpsc::UnboundedSender<StageCommand>,
        state: watch::Receiver<StageState>,
    ) -> Self {
        Self {
            client_id,
            commands,
            state,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> StageState {
        *self.state.borrow()
    }

    /// Stop polling and resolve once the stage has handed every polled message to
    /// the output channel and closed its sending side. Up to `buffer_size` messages
    /// may still be queued in the channel at that point; the stream ends after they
    /// are received. The client stays open, so offsets can still be committed.
    pub async fn stop(&self) {
        if self.state() < StageState::Stopped {
            self.send(StageCommand::Stop);
        }
        self.wait_for(StageState::Stopped).await;
    }

    /// Stop if still running, wait for in-flight commits, then close the client.
    pub async fn shutdown(&self) {
        if self.state() < StageState::Shutdown {
            self.send(StageCommand::Shutdown);
        }
        self.wait_for(StageState::Shutdown).await;
    }

    /// Resolves when the client has been closed, whatever led there: an explicit
    /// `shutdown()`, the output stream being dropped, or a failed poll.
    pub async fn is_shutdown(&self) {
        self.wait_for(StageState::Shutdown).await;
    }

    fn send(&self, command: StageCommand) {
        if self.commands.send(command).is_err() {
            debug!(
                client_id = self.client_id.as_str(),
                "Consumer stage already exited"
            );
        }
    }

    async fn wait_for(&self, target: StageState) {
        let mut state = self.state.clone();
        if state.wait_for(|current| *current >= target).await.is_err() {
            debug!(
                client_id = self.client_id.as_str(),
                target = target.as_str(),
                "Consumer stage exited before reaching target state"
            );
        }
    }
}
