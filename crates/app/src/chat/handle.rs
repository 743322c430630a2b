use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use snafu::Snafu;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::events::{MaxTokensChanged, ModelChanged, SessionCommand, Submit};
use crate::chat::session::{SessionController, SessionState};

/// Why a submit was refused. Refusal never touches the in-flight turn.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum SubmitRejected {
    #[snafu(display("a reply is still streaming"))]
    TurnInFlight,
    #[snafu(display("message is empty"))]
    EmptyMessage,
    #[snafu(display("session has been closed"))]
    SessionClosed,
}

/// Caller-side handle to a session running on its own task.
///
/// Dropping the handle aborts the task, which drops any in-flight response
/// stream and releases its connection.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    busy: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn spawn(controller: SessionController) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let state = controller.subscribe();
        let busy = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_session(controller, receiver, Arc::clone(&busy)));

        Self {
            commands,
            state,
            busy,
            task: Some(task),
        }
    }

    /// Queues a turn unless one is already streaming.
    pub fn try_submit(&self, text: impl Into<String>) -> Result<(), SubmitRejected> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SubmitRejected::EmptyMessage);
        }
        if self.state.borrow().is_streaming() {
            return Err(SubmitRejected::TurnInFlight);
        }
        // Covers the gap between accepting a submit and the task publishing `Streaming`.
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubmitRejected::TurnInFlight);
        }

        if self
            .commands
            .send(SessionCommand::Submit(Submit::new(text)))
            .is_err()
        {
            self.busy.store(false, Ordering::Release);
            return Err(SubmitRejected::SessionClosed);
        }
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) || self.state.borrow().is_streaming()
    }

    /// Takes effect from the next turn on.
    pub fn set_model(&self, model_id: impl Into<String>) -> Result<(), SubmitRejected> {
        self.send(SessionCommand::ModelChanged(ModelChanged {
            model_id: model_id.into(),
        }))
    }

    pub fn set_max_tokens(&self, max_tokens: u64) -> Result<(), SubmitRejected> {
        self.send(SessionCommand::MaxTokensChanged(MaxTokensChanged { max_tokens }))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Stops the session and waits until its task, and the stream it owned, are gone.
    pub async fn discard(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Err(error) if !error.is_cancelled() => {
                    tracing::error!(error = %error, "session task ended abnormally");
                }
                _ => {}
            }
        }
        tracing::debug!("session discarded");
    }

    fn send(&self, command: SessionCommand) -> Result<(), SubmitRejected> {
        self.commands
            .send(command)
            .map_err(|_| SubmitRejected::SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            tracing::debug!("cancelling session task on drop");
            task.abort();
        }
    }
}

async fn run_session(
    mut controller: SessionController,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    busy: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Submit(Submit { content }) => {
                let outcome = controller.submit(content).await;
                tracing::debug!(?outcome, "turn ended");
                busy.store(false, Ordering::Release);
            }
            SessionCommand::ModelChanged(ModelChanged { model_id }) => {
                if let Err(error) = controller.set_model(model_id) {
                    tracing::warn!(error = %error, "failed to persist selected model");
                }
            }
            SessionCommand::MaxTokensChanged(MaxTokensChanged { max_tokens }) => {
                if let Err(error) = controller.set_max_tokens(max_tokens) {
                    tracing::warn!(error = %error, "failed to persist max tokens");
                }
            }
        }
    }
}
