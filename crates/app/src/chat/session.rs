use std::ops::ControlFlow;
use std::sync::Arc;

use chatline_llm::{
    ChatBackend, ChatRequest, Conversation, ProviderResult, StreamEvent, decode_stream,
};
use futures::StreamExt;
use tokio::sync::watch;

use crate::chat::events::TurnOutcome;
use crate::chat::message::{
    ChatMessage, StreamState, StreamTransition, StreamTransitionRejection, TurnId,
};
use crate::settings::{PreferencesProvider, SettingsError};

/// Snapshot of one conversation as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Shared with published snapshots; only cloned when a message is appended.
    pub messages: Arc<Vec<ChatMessage>>,
    /// Assistant text received so far for the in-flight turn. Empty unless streaming.
    pub partial_content: String,
    pub active_conversation_id: Option<i64>,
    pub model: String,
    pub max_tokens: u64,
    pub stream_state: StreamState,
}

impl SessionState {
    fn new(model: String, max_tokens: u64) -> Self {
        Self {
            messages: Arc::default(),
            partial_content: String::new(),
            active_conversation_id: None,
            model,
            max_tokens,
            stream_state: StreamState::Idle,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state.is_streaming()
    }
}

/// Owns one conversation's history and drives its turns against the backend.
///
/// Every state change is published on a watch channel before the next chunk is
/// pulled from the transport, so observers see each delta as it is applied.
pub struct SessionController {
    backend: Arc<dyn ChatBackend>,
    preferences: Arc<dyn PreferencesProvider>,
    temperature: f64,
    state: SessionState,
    next_turn_id: u64,
    publisher: watch::Sender<SessionState>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn ChatBackend>, preferences: Arc<dyn PreferencesProvider>) -> Self {
        let loaded = preferences.load();
        let state = SessionState::new(loaded.selected_model.clone(), loaded.max_tokens);
        let (publisher, _) = watch::channel(state.clone());

        Self {
            backend,
            temperature: loaded.temperature,
            preferences,
            state,
            next_turn_id: 1,
            publisher,
        }
    }

    /// Opens a session that continues an existing backend conversation.
    pub fn with_history(
        backend: Arc<dyn ChatBackend>,
        preferences: Arc<dyn PreferencesProvider>,
        conversation_id: i64,
        messages: Vec<ChatMessage>,
    ) -> Self {
        let mut controller = Self::new(backend, preferences);
        controller.state.active_conversation_id = Some(conversation_id);
        controller.state.messages = Arc::new(messages);
        controller.publish();
        controller
    }

    pub fn from_conversation(
        backend: Arc<dyn ChatBackend>,
        preferences: Arc<dyn PreferencesProvider>,
        conversation: &Conversation,
    ) -> Self {
        let messages = conversation
            .messages
            .iter()
            .map(ChatMessage::from_stored)
            .collect();
        Self::with_history(backend, preferences, conversation.id, messages)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.publisher.subscribe()
    }

    /// Runs one full turn: user message in, assistant message (or failure) out.
    ///
    /// Transport and decode failures end the turn as `Failed` and never escape.
    pub async fn submit(&mut self, user_text: impl Into<String>) -> TurnOutcome {
        let turn = self.allocate_turn();
        let streaming = match self.state.stream_state.apply(StreamTransition::Start(turn)) {
            Ok(next) => next,
            Err(rejection) => {
                tracing::debug!(turn = turn.0, ?rejection, "rejected turn start");
                return TurnOutcome::Rejected(rejection);
            }
        };

        self.push_message(ChatMessage::user(user_text));
        self.state.partial_content.clear();
        self.state.stream_state = streaming;
        self.publish();

        let request = self.build_request();
        tracing::debug!(
            turn = turn.0,
            model_id = %request.model_id,
            messages = request.messages.len(),
            "starting chat turn"
        );

        let chunks = match self.backend.open_stream(&request).await {
            Ok(chunks) => chunks,
            Err(error) => return self.fail_turn(turn, error.to_string()),
        };

        let events = decode_stream(chunks);
        futures::pin_mut!(events);

        while let Some(event) = events.next().await {
            if let ControlFlow::Break(outcome) = self.apply_stream_event(turn, event) {
                return outcome;
            }
        }

        // The server closed the stream without a terminator.
        self.finalize_turn(turn)
    }

    /// Applies one decoded event of `turn`, breaking once the turn is over.
    ///
    /// Events of a turn that is no longer streaming are dropped untouched.
    fn apply_stream_event(
        &mut self,
        turn: TurnId,
        event: ProviderResult<StreamEvent>,
    ) -> ControlFlow<TurnOutcome> {
        if !self.state.stream_state.accepts_stream_event(turn) {
            let rejection = match self.state.stream_state.active_turn() {
                Some(active) => StreamTransitionRejection::TurnMismatch {
                    active,
                    attempted: turn,
                },
                None => StreamTransitionRejection::NoActiveStream,
            };
            tracing::debug!(turn = turn.0, ?rejection, "dropping stale stream event");
            return ControlFlow::Break(TurnOutcome::Rejected(rejection));
        }

        match event {
            Ok(StreamEvent::Delta { text }) => {
                self.state.partial_content.push_str(&text);
                self.publish();
                ControlFlow::Continue(())
            }
            Ok(StreamEvent::Completed { conversation_id }) => {
                self.adopt_conversation_id(conversation_id);
                self.publish();
                ControlFlow::Continue(())
            }
            Ok(StreamEvent::Terminator) => ControlFlow::Break(self.finalize_turn(turn)),
            Err(error) => ControlFlow::Break(self.fail_turn(turn, error.to_string())),
        }
    }

    /// Saves the model and adopts the stored value, which may differ after normalization.
    pub fn set_model(&mut self, model_id: impl Into<String>) -> Result<(), SettingsError> {
        let mut preferences = (*self.preferences.load()).clone();
        preferences.selected_model = model_id.into();
        self.preferences.save(preferences)?;

        self.state.model = self.preferences.load().selected_model.clone();
        tracing::debug!(model_id = %self.state.model, "session model changed");
        self.publish();
        Ok(())
    }

    pub fn set_max_tokens(&mut self, max_tokens: u64) -> Result<(), SettingsError> {
        let mut preferences = (*self.preferences.load()).clone();
        preferences.max_tokens = max_tokens;
        self.preferences.save(preferences)?;

        self.state.max_tokens = self.preferences.load().max_tokens;
        self.publish();
        Ok(())
    }

    fn allocate_turn(&mut self) -> TurnId {
        let turn = TurnId::new(self.next_turn_id);
        self.next_turn_id = self.next_turn_id.saturating_add(1);
        turn
    }

    fn build_request(&self) -> ChatRequest {
        let messages = self
            .state
            .messages
            .iter()
            .map(ChatMessage::to_provider_message)
            .collect();

        ChatRequest::new(self.state.model.clone(), messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.state.max_tokens)
            .with_conversation_id(self.state.active_conversation_id)
    }

    fn adopt_conversation_id(&mut self, conversation_id: Option<i64>) {
        if self.state.active_conversation_id.is_some() {
            return;
        }
        if let Some(id) = conversation_id {
            tracing::debug!(conversation_id = id, "adopted conversation id from backend");
            self.state.active_conversation_id = Some(id);
        }
    }

    fn finalize_turn(&mut self, turn: TurnId) -> TurnOutcome {
        let next = match self.state.stream_state.apply(StreamTransition::Complete(turn)) {
            Ok(next) => next,
            Err(rejection) => return TurnOutcome::Rejected(rejection),
        };

        let content = std::mem::take(&mut self.state.partial_content);
        self.push_message(ChatMessage::assistant(content));
        self.state.stream_state = next;
        self.publish();

        tracing::debug!(turn = turn.0, "chat turn finalized");
        TurnOutcome::Finalized { turn }
    }

    fn fail_turn(&mut self, turn: TurnId, message: String) -> TurnOutcome {
        let next = match self.state.stream_state.apply(StreamTransition::Fail {
            turn,
            message: message.clone(),
        }) {
            Ok(next) => next,
            Err(rejection) => return TurnOutcome::Rejected(rejection),
        };

        let partial = std::mem::take(&mut self.state.partial_content);
        let content = if partial.is_empty() {
            format!("request failed: {message}")
        } else {
            partial
        };
        self.push_message(ChatMessage::assistant_error(content, message.clone()));
        self.state.stream_state = next;
        self.publish();

        tracing::warn!(turn = turn.0, error = %message, "chat turn failed");
        TurnOutcome::Failed { turn, message }
    }

    fn push_message(&mut self, message: ChatMessage) {
        Arc::make_mut(&mut self.state.messages).push(message);
    }

    fn publish(&self) {
        self.publisher.send_replace(self.state.clone());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use chatline_llm::{
        BoxFuture, ByteChunkStream, ProviderError, ProviderResult, Role, StoredMessage,
    };
    use futures::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::chat::message::MessageStatus;
    use crate::settings::{MemoryPreferences, Preferences};

    /// Backend that replays a fixed script and records every request it receives.
    pub(crate) struct ScriptedBackend {
        script: Mutex<Vec<ProviderResult<ByteChunkStream>>>,
        pub(crate) requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Vec<ProviderResult<ByteChunkStream>>) -> Self {
            Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn chunks(chunks: &[&'static str]) -> ProviderResult<ByteChunkStream> {
            let items: Vec<ProviderResult<Bytes>> = chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect();
            Ok(stream::iter(items).boxed())
        }

        fn recorded(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn open_stream<'a>(
            &'a self,
            request: &'a ChatRequest,
        ) -> BoxFuture<'a, ProviderResult<ByteChunkStream>> {
            Box::pin(async move {
                self.requests
                    .lock()
                    .expect("requests lock")
                    .push(request.clone());
                let mut script = self.script.lock().expect("script lock");
                assert!(!script.is_empty(), "unexpected extra turn");
                script.remove(0)
            })
        }
    }

    fn controller(backend: Arc<ScriptedBackend>) -> SessionController {
        SessionController::new(backend, Arc::new(MemoryPreferences::default()))
    }

    #[tokio::test]
    async fn completed_then_terminator_finalizes_and_adopts_id() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::chunks(&[
            "data: {\"chunk\":\"Hi there\"}\n\n",
            "data: {\"conversation_id\":42}\n\ndata: [DONE]\n\n",
        ])]));
        let mut controller = controller(backend);

        let outcome = controller.submit("hello").await;

        assert!(outcome.is_finalized());
        let state = controller.state();
        assert_eq!(state.active_conversation_id, Some(42));
        assert!(!state.is_streaming());
        assert!(state.partial_content.is_empty());
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].role, Role::User);
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages[1].content, "Hi there");
        assert_eq!(state.messages[1].status, MessageStatus::Done);
    }

    #[tokio::test]
    async fn split_frames_join_into_one_reply() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::chunks(&[
            "data: {\"chu",
            "nk\":\"Hel\"}\n\ndata: {\"chunk\":\"lo\"}\n",
            "\ndata: [DONE]\n\n",
        ])]));
        let mut controller = controller(backend);

        controller.submit("greet me").await;

        assert_eq!(controller.state().messages[1].content, "Hello");
    }

    #[tokio::test]
    async fn eof_without_terminator_finalizes() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::chunks(&[
            "data: {\"chunk\":\"partial answer\"}",
        ])]));
        let mut controller = controller(backend);

        let outcome = controller.submit("q").await;

        assert!(outcome.is_finalized());
        assert_eq!(controller.state().messages[1].content, "partial answer");
    }

    #[tokio::test]
    async fn transport_error_produces_error_message() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            ProviderError::TransportStatus {
                stage: "test",
                status: 503,
                body: "overloaded".to_string(),
            },
        )]));
        let mut controller = controller(backend);

        let outcome = controller.submit("hello").await;

        let TurnOutcome::Failed { message, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("503"));
        let state = controller.state();
        assert!(!state.is_streaming());
        assert!(matches!(state.stream_state, StreamState::Failed { .. }));
        assert_eq!(state.messages.len(), 2);
        let reply = &state.messages[1];
        assert!(reply.is_error());
        assert!(reply.content.starts_with("request failed:"));
        assert_eq!(reply.error_notice(), Some(message.as_str()));
    }

    #[tokio::test]
    async fn mid_stream_drop_keeps_partial_content() {
        let items: Vec<ProviderResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"chunk\":\"Hal\"}\n")),
            Ok(Bytes::from_static(b"data: {\"chunk\":\"f an\"}\n")),
            Err(ProviderError::StreamRead {
                stage: "test",
                details: "connection reset".to_string(),
            }),
        ];
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(stream::iter(items).boxed())]));
        let mut controller = controller(backend);

        controller.submit("hello").await;

        let reply = &controller.state().messages[1];
        assert_eq!(reply.content, "Half an");
        assert!(reply.is_error());
        assert!(controller.state().partial_content.is_empty());
    }

    #[tokio::test]
    async fn request_carries_full_history_and_settings() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptedBackend::chunks(&["data: {\"chunk\":\"one\",\"conversation_id\":7}\n"]),
            ScriptedBackend::chunks(&["data: {\"chunk\":\"two\",\"conversation_id\":99}\n"]),
        ]));
        let preferences = Arc::new(MemoryPreferences::new(Preferences {
            selected_model: "gpt-4".to_string(),
            max_tokens: 256,
            temperature: 0.2,
            ..Preferences::default()
        }));
        let mut controller = SessionController::new(backend.clone(), preferences);

        controller.submit("first").await;
        controller.submit("second").await;

        let requests = backend.recorded();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].conversation_id, None);
        assert_eq!(requests[0].model_id, "gpt-4");
        assert_eq!(requests[0].max_tokens, 256);
        assert_eq!(requests[0].temperature, 0.2);

        let contents: Vec<&str> = requests[1]
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(contents, ["first", "one", "second"]);
        assert_eq!(requests[1].conversation_id, Some(7));
        // The first id a conversation receives sticks.
        assert_eq!(controller.state().active_conversation_id, Some(7));
    }

    #[tokio::test]
    async fn failed_turn_is_idle_equivalent_for_next_submit() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(ProviderError::StreamRead {
                stage: "test",
                details: "reset".to_string(),
            }),
            ScriptedBackend::chunks(&["data: {\"chunk\":\"ok\"}\ndata: [DONE]\n"]),
        ]));
        let mut controller = controller(backend.clone());

        controller.submit("first").await;
        let outcome = controller.submit("retry").await;

        assert!(outcome.is_finalized());
        assert_eq!(controller.state().messages.len(), 4);
        assert_eq!(backend.recorded()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn each_delta_is_published_before_the_next_pull() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<ProviderResult<Bytes>>();
        let chunks = stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(chunks)]));
        let mut controller = controller(backend);
        let mut observer = controller.subscribe();

        let drive = async move {
            chunk_tx
                .send(Ok(Bytes::from_static(b"data: {\"chunk\":\"Hel\"}\n")))
                .expect("send first chunk");
            let seen = observer
                .wait_for(|state| state.partial_content == "Hel")
                .await
                .expect("session alive")
                .clone();
            assert!(seen.is_streaming());
            assert_eq!(seen.messages.len(), 1);

            chunk_tx
                .send(Ok(Bytes::from_static(b"data: {\"chunk\":\"lo\"}\ndata: [DONE]\n")))
                .expect("send second chunk");
        };

        let (outcome, ()) = tokio::join!(controller.submit("hi"), drive);

        assert!(outcome.is_finalized());
        assert_eq!(controller.state().messages[1].content, "Hello");
    }

    #[tokio::test]
    async fn settings_changes_write_through_and_apply_to_next_turn() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptedBackend::chunks(&[
            "data: [DONE]\n",
        ])]));
        let preferences = Arc::new(MemoryPreferences::default());
        let mut controller = SessionController::new(backend.clone(), preferences.clone());

        controller.set_model("gpt-4-turbo").expect("model saved");
        controller.set_max_tokens(64).expect("max tokens saved");
        assert_eq!(preferences.load().selected_model, "gpt-4-turbo");
        assert_eq!(preferences.load().max_tokens, 64);
        assert_eq!(controller.subscribe().borrow().model, "gpt-4-turbo");

        controller.submit("hi").await;
        let request = &backend.recorded()[0];
        assert_eq!(request.model_id, "gpt-4-turbo");
        assert_eq!(request.max_tokens, 64);
    }

    #[tokio::test]
    async fn model_change_adopts_the_normalized_value() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptedBackend::chunks(&["data: [DONE]\n"]),
            ScriptedBackend::chunks(&["data: [DONE]\n"]),
        ]));
        let preferences = Arc::new(MemoryPreferences::default());
        let mut controller = SessionController::new(backend.clone(), preferences.clone());

        controller.set_model("   ").expect("model saved");
        assert_eq!(preferences.load().selected_model, chatline_llm::DEFAULT_MODEL);
        assert_eq!(controller.state().model, chatline_llm::DEFAULT_MODEL);
        assert_eq!(
            controller.subscribe().borrow().model,
            chatline_llm::DEFAULT_MODEL
        );
        controller.submit("hi").await;

        controller.set_model(" gpt-4o ").expect("model saved");
        assert_eq!(controller.state().model, "gpt-4o");
        controller.submit("again").await;

        let requests = backend.recorded();
        assert_eq!(requests[0].model_id, chatline_llm::DEFAULT_MODEL);
        assert_eq!(requests[1].model_id, "gpt-4o");
    }

    #[test]
    fn events_for_another_turn_are_dropped() {
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let mut controller = controller(backend);
        controller.state.stream_state = StreamState::Streaming(TurnId::new(2));

        let late = Ok(StreamEvent::Delta {
            text: "late".to_string(),
        });
        let flow = controller.apply_stream_event(TurnId::new(1), late);

        assert_eq!(
            flow,
            ControlFlow::Break(TurnOutcome::Rejected(
                StreamTransitionRejection::TurnMismatch {
                    active: TurnId::new(2),
                    attempted: TurnId::new(1),
                }
            ))
        );
        assert!(controller.state().partial_content.is_empty());
        assert!(controller.state().messages.is_empty());
    }

    #[test]
    fn events_after_the_turn_ended_are_dropped() {
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let mut controller = controller(backend);
        controller.state.stream_state = StreamState::Finalized(TurnId::new(1));

        let flow = controller.apply_stream_event(TurnId::new(1), Ok(StreamEvent::Terminator));

        assert_eq!(
            flow,
            ControlFlow::Break(TurnOutcome::Rejected(
                StreamTransitionRejection::NoActiveStream
            ))
        );
        assert_eq!(
            controller.state().stream_state,
            StreamState::Finalized(TurnId::new(1))
        );
        assert!(controller.state().messages.is_empty());
    }

    #[test]
    fn delta_snapshots_share_the_message_history() {
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let mut controller = SessionController::with_history(
            backend,
            Arc::new(MemoryPreferences::default()),
            3,
            vec![ChatMessage::user("earlier"), ChatMessage::assistant("reply")],
        );
        let observer = controller.subscribe();
        controller.state.stream_state = StreamState::Streaming(TurnId::new(1));

        for text in ["a", "b"] {
            let delta = Ok(StreamEvent::Delta {
                text: text.to_string(),
            });
            assert_eq!(
                controller.apply_stream_event(TurnId::new(1), delta),
                ControlFlow::Continue(())
            );
            let snapshot = observer.borrow();
            assert!(Arc::ptr_eq(&snapshot.messages, &controller.state().messages));
        }
        assert_eq!(observer.borrow().partial_content, "ab");
    }

    #[tokio::test]
    async fn history_is_restored_from_stored_conversation() {
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let conversation = Conversation {
            id: 12,
            user_id: 1,
            title: Some("trip".to_string()),
            model: None,
            temperature: None,
            max_tokens: None,
            created_at: "2024-05-01T10:00:00".to_string(),
            updated_at: None,
            messages: vec![StoredMessage {
                id: 1,
                conversation_id: 12,
                role: Role::User,
                content: "where to?".to_string(),
                usage: None,
                created_at: "2024-05-01T10:00:00".to_string(),
            }],
        };

        let controller = SessionController::from_conversation(
            backend,
            Arc::new(MemoryPreferences::default()),
            &conversation,
        );

        let observed = controller.subscribe().borrow().clone();
        assert_eq!(observed.active_conversation_id, Some(12));
        assert_eq!(observed.messages.len(), 1);
        assert_eq!(observed.messages[0].content, "where to?");
        assert!(observed.messages[0].timestamp.is_some());
    }
}
