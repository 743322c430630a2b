use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            access_token: access_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        self.access_token = if token.is_empty() { None } else { Some(token) };
        self
    }

    /// Joins `path` onto the base URL with exactly one separating slash.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Chat speaker role as the backend spells it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Parameters for one chat turn, shared by the streaming and one-shot endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub conversation_id: Option<i64>,
}

impl ChatRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            conversation_id: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<i64>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub(crate) fn body(&self, stream: bool) -> ChatRequestBody<'_> {
        ChatRequestBody {
            messages: &self.messages,
            model: &self.model_id,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            conversation_id: self.conversation_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequestBody<'a> {
    pub messages: &'a [ProviderMessage],
    pub model: &'a str,
    pub temperature: f64,
    pub max_tokens: u64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Raw response body chunks in arrival order. Dropping the stream releases the connection.
pub type ByteChunkStream = BoxStream<'static, ProviderResult<Bytes>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("backend base URL is not configured"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("failed to build HTTP client on `{stage}`, {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to backend failed on `{stage}`, {source}"))]
    Connect {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status} on `{stage}`: {body}"))]
    TransportStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("connection dropped while reading the response stream: {details}"))]
    StreamRead {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to decode backend response on `{stage}`, {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("chat request has no messages"))]
    EmptyMessageSet { stage: &'static str },
}

impl ProviderError {
    /// HTTP status for errors raised by a non-success response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TransportStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_stream_read(&self) -> bool {
        matches!(self, Self::StreamRead { .. })
    }
}

/// Seam between the session controller and the network.
pub trait ChatBackend: Send + Sync {
    /// Opens one streaming chat turn and returns its raw body chunks.
    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, ProviderResult<ByteChunkStream>>;
}
