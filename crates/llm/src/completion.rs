use reqwest::Method;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::provider::{
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, ChatRequest, EmptyMessageSetSnafu, ProviderResult,
};
use super::transport::{BackendClient, CHAT_PATH};

pub const PROMPT_PATH: &str = "/prompt/completion";

/// Token accounting reported by the backend; any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompletionResponse {
    pub response: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

/// A single free-standing prompt, without conversation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRequest {
    pub message: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    stream: bool,
}

impl PromptRequest {
    pub fn new(message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: false,
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
}

impl BackendClient {
    /// Runs one chat turn without streaming and returns the whole answer.
    pub async fn complete_chat(&self, request: &ChatRequest) -> ProviderResult<CompletionResponse> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "complete-chat",
            }
        );

        let builder = self
            .request(Method::POST, CHAT_PATH)
            .json(&request.body(false));
        self.send_json(builder, "complete-chat").await
    }

    pub async fn complete_prompt(
        &self,
        request: &PromptRequest,
    ) -> ProviderResult<CompletionResponse> {
        let builder = self.request(Method::POST, PROMPT_PATH).json(request);
        self.send_json(builder, "complete-prompt").await
    }
}
