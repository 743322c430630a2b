use crate::chat::message::{StreamTransitionRejection, TurnId};

/// Emitted when the user submits a prompt to generate a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submit {
    pub content: String,
}

/// Emitted when active model selection changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChanged {
    pub model_id: String,
}

/// Emitted when the per-turn token budget changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxTokensChanged {
    pub max_tokens: u64,
}

/// Commands accepted by a running session's control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Submit(Submit),
    ModelChanged(ModelChanged),
    MaxTokensChanged(MaxTokensChanged),
}

/// How one `submit` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Finalized { turn: TurnId },
    Failed { turn: TurnId, message: String },
    /// The lifecycle refused to start; session state was left untouched.
    Rejected(StreamTransitionRejection),
}

impl Submit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl TurnOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized { .. })
    }
}
