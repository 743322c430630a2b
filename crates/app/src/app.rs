use std::io::{self, Write};
use std::sync::Arc;

use chatline_llm::{
    BackendClient, ChatBackend, DEFAULT_PAGE_SIZE, LoginCredentials, ModelCatalog,
    ModelCatalogSource, ProviderError, RegisterCredentials, Token, is_known_model,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::chat::{ChatMessage, Role, SessionController, SessionHandle, SessionState};
use crate::settings::{PreferencesProvider, SettingsError};

const HELP: &str = "\
commands:
  /login <email> <password>             sign in and keep the token
  /register <email> <password> [name]   create an account and sign in
  /models                               list available models
  /model <id>                           switch model for the next turn
  /tokens <n>                           set the reply token budget
  /list                                 list saved conversations
  /open <id>                            continue a saved conversation
  /new                                  start a new conversation
  /rename <id> <title>                  rename a saved conversation
  /delete <id>                          delete a saved conversation
  /quit                                 exit
anything else is sent as a message; Ctrl-C cancels a reply in progress";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("backend request failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: io::Error,
    },
    #[snafu(display("{message}"))]
    InvalidCommand {
        stage: &'static str,
        message: String,
    },
}

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Login {
        email: String,
        password: String,
    },
    Register {
        email: String,
        password: String,
        full_name: Option<String>,
    },
    Models,
    Model(String),
    Tokens(u64),
    List,
    Open(i64),
    New,
    Rename {
        conversation_id: i64,
        title: String,
    },
    Delete(i64),
    Help,
    Quit,
}

impl Command {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Self>, AppError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Send(line.to_string())));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "login" => {
                let (email, password) = two_args(args, "/login <email> <password>")?;
                Self::Login { email, password }
            }
            "register" => {
                let mut parts = args.splitn(3, char::is_whitespace);
                let (Some(email), Some(password)) = (parts.next(), parts.next()) else {
                    return usage("/register <email> <password> [name]");
                };
                if email.is_empty() || password.is_empty() {
                    return usage("/register <email> <password> [name]");
                }
                let full_name = parts
                    .next()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string);
                Self::Register {
                    email: email.to_string(),
                    password: password.to_string(),
                    full_name,
                }
            }
            "models" => Self::Models,
            "model" if !args.is_empty() => Self::Model(args.to_string()),
            "model" => return usage("/model <id>"),
            "tokens" => match args.parse::<u64>() {
                Ok(max_tokens) if max_tokens > 0 => Self::Tokens(max_tokens),
                _ => return usage("/tokens <positive number>"),
            },
            "list" => Self::List,
            "open" => Self::Open(conversation_id(args, "/open <id>")?),
            "new" => Self::New,
            "rename" => {
                let Some((id, title)) = args.split_once(char::is_whitespace) else {
                    return usage("/rename <id> <title>");
                };
                Self::Rename {
                    conversation_id: conversation_id(id, "/rename <id> <title>")?,
                    title: title.trim().to_string(),
                }
            }
            "delete" => Self::Delete(conversation_id(args, "/delete <id>")?),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => {
                return InvalidCommandSnafu {
                    stage: "parse-command",
                    message: format!("unknown command `/{other}`, try /help"),
                }
                .fail();
            }
        };
        Ok(Some(command))
    }
}

fn usage<T>(text: &str) -> Result<T, AppError> {
    InvalidCommandSnafu {
        stage: "parse-command",
        message: format!("usage: {text}"),
    }
    .fail()
}

fn two_args(args: &str, text: &str) -> Result<(String, String), AppError> {
    let mut parts = args.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(second), None) => Ok((first.to_string(), second.to_string())),
        _ => usage(text),
    }
}

fn conversation_id(raw: &str, text: &str) -> Result<i64, AppError> {
    match raw.trim().parse::<i64>() {
        Ok(id) => Ok(id),
        Err(_) => usage(text),
    }
}

/// Prints session snapshots incrementally so deltas appear as they arrive.
#[derive(Debug, Default)]
pub struct TurnPrinter {
    seen_messages: usize,
    printed_partial: usize,
}

impl TurnPrinter {
    /// Treats everything already in `state` as printed.
    pub fn sync(&mut self, state: &SessionState) {
        self.seen_messages = state.messages.len();
        self.printed_partial = state.partial_content.len();
    }

    pub fn render(&mut self, state: &SessionState, out: &mut impl Write) -> io::Result<()> {
        if state.is_streaming() {
            if state.messages.len() > self.seen_messages {
                // New turn; the user message was typed, not printed.
                self.seen_messages = state.messages.len();
                self.printed_partial = 0;
            }
            if let Some(fresh) = state.partial_content.get(self.printed_partial..) {
                out.write_all(fresh.as_bytes())?;
                self.printed_partial = state.partial_content.len();
            }
            return out.flush();
        }

        for message in state.messages.iter().skip(self.seen_messages) {
            if message.role == Role::User {
                continue;
            }
            let remainder = message
                .content
                .get(self.printed_partial..)
                .unwrap_or(&message.content);
            writeln!(out, "{remainder}")?;
            if let Some(notice) = message.error_notice() {
                writeln!(out, "[error: {notice}]")?;
            }
            self.printed_partial = 0;
        }
        self.seen_messages = state.messages.len();
        out.flush()
    }
}

/// Interactive terminal session against one backend.
pub struct App {
    client: BackendClient,
    preferences: Arc<dyn PreferencesProvider>,
    session: SessionHandle,
    printer: TurnPrinter,
    catalog: Option<ModelCatalog>,
}

impl App {
    pub fn new(preferences: Arc<dyn PreferencesProvider>) -> Result<Self, AppError> {
        let config = preferences.load().to_backend_config();
        let client = BackendClient::new(config).context(BackendSnafu {
            stage: "build-backend-client",
        })?;
        let session = SessionHandle::spawn(SessionController::new(
            backend(&client),
            Arc::clone(&preferences),
        ));

        Ok(Self {
            client,
            preferences,
            session,
            printer: TurnPrinter::default(),
            catalog: None,
        })
    }

    pub async fn run(mut self) -> Result<(), AppError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut updates = self.session.subscribe();

        let preferences = self.preferences.load();
        println!(
            "chatline connected to {} using {} ({})",
            self.client.config().base_url,
            preferences.selected_model,
            if preferences.is_signed_in() {
                "signed in"
            } else {
                "not signed in, use /login"
            }
        );
        println!("type /help for commands");

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin-line" })? else {
                        break;
                    };
                    let command = match Command::parse(&line) {
                        Ok(Some(command)) => command,
                        Ok(None) => continue,
                        Err(error) => {
                            eprintln!("{error}");
                            continue;
                        }
                    };
                    if command == Command::Quit {
                        break;
                    }
                    if let Err(error) = self.execute(command).await {
                        tracing::debug!(error = %error, "command failed");
                        eprintln!("error: {error}");
                    }
                    updates = self.session.subscribe();
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        tracing::warn!("session task stopped unexpectedly, starting a new conversation");
                        self.replace_session(None).await;
                        updates = self.session.subscribe();
                        continue;
                    }
                    let state = updates.borrow_and_update().clone();
                    let mut stdout = io::stdout().lock();
                    self.printer
                        .render(&state, &mut stdout)
                        .context(WriteOutputSnafu { stage: "render-session" })?;
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context(ReadInputSnafu { stage: "listen-ctrl-c" })?;
                    if !self.session.is_busy() {
                        break;
                    }
                    let conversation_id = self.session.state().active_conversation_id;
                    tracing::debug!(?conversation_id, "cancelling reply on ctrl-c");
                    self.replace_session(None).await;
                    updates = self.session.subscribe();
                    println!("\n[reply cancelled, conversation closed]");
                }
            }
        }

        self.session.discard().await;
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> Result<(), AppError> {
        match command {
            Command::Send(text) => {
                self.session
                    .try_submit(text)
                    .map_err(|rejected| AppError::InvalidCommand {
                        stage: "submit-message",
                        message: rejected.to_string(),
                    })?;
            }
            Command::Login { email, password } => {
                let token = self
                    .client
                    .login(&LoginCredentials { email, password })
                    .await
                    .context(BackendSnafu { stage: "login" })?;
                self.adopt_token(token).await?;
            }
            Command::Register {
                email,
                password,
                full_name,
            } => {
                let token = self
                    .client
                    .register(&RegisterCredentials {
                        email,
                        password,
                        full_name,
                    })
                    .await
                    .context(BackendSnafu { stage: "register" })?;
                self.adopt_token(token).await?;
            }
            Command::Models => {
                let catalog = self.client.fetch_models().await;
                if catalog.source == ModelCatalogSource::StaticFallback {
                    println!("(backend catalog unavailable, showing built-in models)");
                }
                let current = self.session.state().model;
                for model in &catalog.models {
                    let marker = if model.id == current { "*" } else { " " };
                    let description = model.description.as_deref().unwrap_or_default();
                    println!("{marker} {:<16} {:<20} {description}", model.id, model.name);
                }
                self.catalog = Some(catalog);
            }
            Command::Model(model_id) => {
                let known = is_known_model(&model_id)
                    || self
                        .catalog
                        .as_ref()
                        .is_some_and(|catalog| catalog.contains(&model_id));
                snafu::ensure!(
                    known,
                    InvalidCommandSnafu {
                        stage: "select-model",
                        message: format!("unknown model `{model_id}`, see /models"),
                    }
                );
                self.session.set_model(&model_id).map_err(closed)?;
                println!("model set to {model_id}");
            }
            Command::Tokens(max_tokens) => {
                self.session.set_max_tokens(max_tokens).map_err(closed)?;
                println!("max tokens set to {max_tokens}");
            }
            Command::List => {
                let conversations = self
                    .client
                    .list_conversations(0, DEFAULT_PAGE_SIZE)
                    .await
                    .context(BackendSnafu {
                        stage: "list-conversations",
                    })?;
                if conversations.is_empty() {
                    println!("no saved conversations");
                }
                for conversation in conversations {
                    println!(
                        "{:>6}  {:<40}  {} messages",
                        conversation.id,
                        conversation.title.as_deref().unwrap_or("(untitled)"),
                        conversation.message_count
                    );
                }
            }
            Command::Open(conversation_id) => {
                let conversation = self
                    .client
                    .get_conversation(conversation_id)
                    .await
                    .context(BackendSnafu {
                        stage: "open-conversation",
                    })?;
                let controller = SessionController::from_conversation(
                    backend(&self.client),
                    Arc::clone(&self.preferences),
                    &conversation,
                );
                self.replace_session(Some(controller)).await;

                let state = self.session.state();
                println!(
                    "opened conversation {} ({})",
                    conversation.id,
                    conversation.title.as_deref().unwrap_or("untitled")
                );
                for message in state.messages.iter() {
                    print_history_entry(message);
                }
            }
            Command::New => {
                self.replace_session(None).await;
                println!("started a new conversation");
            }
            Command::Rename {
                conversation_id,
                title,
            } => {
                let renamed = self
                    .client
                    .rename_conversation(conversation_id, &title)
                    .await
                    .context(BackendSnafu {
                        stage: "rename-conversation",
                    })?;
                println!(
                    "renamed conversation {} to {}",
                    renamed.id,
                    renamed.title.as_deref().unwrap_or(&title)
                );
            }
            Command::Delete(conversation_id) => {
                self.client
                    .delete_conversation(conversation_id)
                    .await
                    .context(BackendSnafu {
                        stage: "delete-conversation",
                    })?;
                if self.session.state().active_conversation_id == Some(conversation_id) {
                    self.replace_session(None).await;
                }
                println!("deleted conversation {conversation_id}");
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
        Ok(())
    }

    async fn adopt_token(&mut self, token: Token) -> Result<(), AppError> {
        let mut preferences = (*self.preferences.load()).clone();
        preferences.access_token = Some(token.access_token.clone());
        self.preferences.save(preferences).context(SettingsSnafu {
            stage: "save-access-token",
        })?;

        self.client = self.client.with_access_token(token.access_token);
        self.replace_session(None).await;
        println!("signed in as {}", token.user.display_name());
        Ok(())
    }

    /// Discards the current session, including any reply in flight.
    async fn replace_session(&mut self, controller: Option<SessionController>) {
        let controller = controller.unwrap_or_else(|| {
            SessionController::new(backend(&self.client), Arc::clone(&self.preferences))
        });
        let previous = std::mem::replace(&mut self.session, SessionHandle::spawn(controller));
        previous.discard().await;
        self.printer.sync(&self.session.state());
    }
}

fn backend(client: &BackendClient) -> Arc<dyn ChatBackend> {
    Arc::new(client.clone())
}

fn closed(rejected: crate::chat::SubmitRejected) -> AppError {
    AppError::InvalidCommand {
        stage: "update-session",
        message: rejected.to_string(),
    }
}

fn print_history_entry(message: &ChatMessage) {
    let stamp = message
        .timestamp
        .map(|timestamp| timestamp.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    println!("[{stamp}] {}: {}", message.role.as_str(), message.content);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{MessageStatus, StreamState, TurnId};

    #[test]
    fn plain_lines_are_messages_and_blank_lines_are_skipped() {
        assert_eq!(
            Command::parse("  what is rust?  ").expect("parses"),
            Some(Command::Send("what is rust?".to_string()))
        );
        assert_eq!(Command::parse("   ").expect("parses"), None);
    }

    #[test]
    fn commands_parse_their_arguments() {
        assert_eq!(
            Command::parse("/login ada@example.com hunter2").expect("parses"),
            Some(Command::Login {
                email: "ada@example.com".to_string(),
                password: "hunter2".to_string(),
            })
        );
        assert_eq!(
            Command::parse("/register ada@example.com pw Ada Lovelace").expect("parses"),
            Some(Command::Register {
                email: "ada@example.com".to_string(),
                password: "pw".to_string(),
                full_name: Some("Ada Lovelace".to_string()),
            })
        );
        assert_eq!(
            Command::parse("/rename 12 Trip plans").expect("parses"),
            Some(Command::Rename {
                conversation_id: 12,
                title: "Trip plans".to_string(),
            })
        );
        assert_eq!(
            Command::parse("/tokens 256").expect("parses"),
            Some(Command::Tokens(256))
        );
        assert_eq!(
            Command::parse("/model gpt-4o").expect("parses"),
            Some(Command::Model("gpt-4o".to_string()))
        );
        assert_eq!(Command::parse("/quit").expect("parses"), Some(Command::Quit));
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for line in ["/tokens 0", "/tokens many", "/open abc", "/login only-email", "/model", "/frobnicate"] {
            let error = Command::parse(line).expect_err(line);
            assert!(matches!(error, AppError::InvalidCommand { .. }), "{line}");
        }
    }

    fn streaming_state(messages: Vec<ChatMessage>, partial: &str) -> SessionState {
        SessionState {
            messages: Arc::new(messages),
            partial_content: partial.to_string(),
            active_conversation_id: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1000,
            stream_state: StreamState::Streaming(TurnId::new(1)),
        }
    }

    #[test]
    fn printer_writes_only_new_text() {
        let mut printer = TurnPrinter::default();
        let mut out = Vec::new();
        let user = ChatMessage::user("hi");

        printer
            .render(&streaming_state(vec![user.clone()], "Hel"), &mut out)
            .expect("write to vec");
        printer
            .render(&streaming_state(vec![user.clone()], "Hello"), &mut out)
            .expect("write to vec");

        let mut done = streaming_state(vec![user, ChatMessage::assistant("Hello!")], "");
        done.stream_state = StreamState::Finalized(TurnId::new(1));
        printer.render(&done, &mut out).expect("write to vec");

        assert_eq!(String::from_utf8(out).expect("utf8"), "Hello!\n");
    }

    #[test]
    fn printer_reports_failed_turns() {
        let mut printer = TurnPrinter::default();
        let mut out = Vec::new();
        let mut failed = streaming_state(
            vec![
                ChatMessage::user("hi"),
                ChatMessage::assistant_error("request failed: refused", "refused"),
            ],
            "",
        );
        failed.stream_state = StreamState::Failed {
            turn: TurnId::new(1),
            message: "refused".to_string(),
        };

        printer.render(&failed, &mut out).expect("write to vec");

        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "request failed: refused\n[error: refused]\n"
        );
        assert!(matches!(failed.messages[1].status, MessageStatus::Error(_)));
    }
}
