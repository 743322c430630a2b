use chrono::{DateTime, NaiveDateTime, Utc};
use chatline_llm::{ProviderMessage, StoredMessage};

pub use chatline_llm::Role;

/// Identifier for one submitted turn.
///
/// This must change on every submit so a late transition from an earlier turn is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Creates a typed turn identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Outcome annotation for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Done,
    /// The turn that produced this message failed; carries the failure notice.
    Error(String),
}

/// One entry of the session history. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Creates a message stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
            status,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageStatus::Done)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessageStatus::Done)
    }

    /// Assistant message produced by a failed turn.
    pub fn assistant_error(content: impl Into<String>, notice: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessageStatus::Error(notice.into()))
    }

    /// Rebuilds a message from the backend's persisted history.
    pub fn from_stored(stored: &StoredMessage) -> Self {
        Self {
            role: stored.role,
            content: stored.content.clone(),
            timestamp: parse_backend_timestamp(&stored.created_at),
            status: MessageStatus::Done,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, MessageStatus::Error(_))
    }

    pub fn error_notice(&self) -> Option<&str> {
        match &self.status {
            MessageStatus::Error(notice) => Some(notice),
            MessageStatus::Done => None,
        }
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage::new(self.role, self.content.clone())
    }
}

/// Parses RFC 3339 timestamps, and naive ones (which the backend emits in UTC).
fn parse_backend_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Turn lifecycle for one session.
///
/// `Finalized` and `Failed` behave like `Idle` for the next `Start`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(TurnId),
    Finalized(TurnId),
    Failed { turn: TurnId, message: String },
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(TurnId),
    Complete(TurnId),
    Fail { turn: TurnId, message: String },
}

/// Rejection reason for illegal lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming { active: TurnId, attempted: TurnId },
    NoActiveStream,
    TurnMismatch { active: TurnId, attempted: TurnId },
}

/// Result type for lifecycle transition application.
pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns the in-flight turn if and only if state is `Streaming`.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Finalized(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    /// Returns true when an event for `turn` may still mutate the session.
    pub fn accepts_stream_event(&self, turn: TurnId) -> bool {
        matches!(self, Self::Streaming(active) if *active == turn)
    }

    /// Applies one transition deterministically.
    ///
    /// Any terminal transition (`Complete`/`Fail`) must match the in-flight turn exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(turn) => self.apply_start(turn),
            StreamTransition::Complete(turn) => self.apply_complete(turn),
            StreamTransition::Fail { turn, message } => self.apply_fail(turn, message),
        }
    }

    fn apply_start(&self, turn: TurnId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) => Err(StreamTransitionRejection::AlreadyStreaming {
                active: *active,
                attempted: turn,
            }),
            Self::Idle | Self::Finalized(_) | Self::Failed { .. } => Ok(Self::Streaming(turn)),
        }
    }

    fn apply_complete(&self, turn: TurnId) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == turn => Ok(Self::Finalized(turn)),
            Self::Streaming(active) => Err(StreamTransitionRejection::TurnMismatch {
                active: *active,
                attempted: turn,
            }),
            Self::Idle | Self::Finalized(_) | Self::Failed { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }

    fn apply_fail(&self, turn: TurnId, message: String) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == turn => Ok(Self::Failed { turn, message }),
            Self::Streaming(active) => Err(StreamTransitionRejection::TurnMismatch {
                active: *active,
                attempted: turn,
            }),
            Self::Idle | Self::Finalized(_) | Self::Failed { .. } => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}
