/// Commands and turn outcomes exchanged with a running session.
pub mod events;
/// Caller-facing session handle with the admission policy.
pub mod handle;
/// Domain entities and deterministic stream state boundaries.
pub mod message;
pub mod session;

pub use events::{MaxTokensChanged, ModelChanged, SessionCommand, Submit, TurnOutcome};
pub use handle::{SessionHandle, SubmitRejected};
pub use message::{
    ChatMessage, MessageStatus, Role, StreamState, StreamTransition, StreamTransitionRejection,
    StreamTransitionResult, TurnId,
};
pub use session::{SessionController, SessionState};
