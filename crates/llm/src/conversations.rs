use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::completion::Usage;
use super::provider::{ProviderResult, Role};
use super::transport::BackendClient;

pub const CONVERSATIONS_PATH: &str = "/conversations/";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub message_count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewConversation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

fn conversation_path(conversation_id: i64) -> String {
    format!("{CONVERSATIONS_PATH}{conversation_id}")
}

impl BackendClient {
    pub async fn list_conversations(
        &self,
        skip: u32,
        limit: u32,
    ) -> ProviderResult<Vec<ConversationSummary>> {
        let builder = self
            .request(Method::GET, CONVERSATIONS_PATH)
            .query(&[("skip", skip), ("limit", limit)]);
        self.send_json(builder, "list-conversations").await
    }

    pub async fn get_conversation(&self, conversation_id: i64) -> ProviderResult<Conversation> {
        let builder = self.request(Method::GET, &conversation_path(conversation_id));
        self.send_json(builder, "get-conversation").await
    }

    pub async fn create_conversation(
        &self,
        conversation: &NewConversation,
    ) -> ProviderResult<Conversation> {
        let builder = self
            .request(Method::POST, CONVERSATIONS_PATH)
            .json(conversation);
        self.send_json(builder, "create-conversation").await
    }

    pub async fn delete_conversation(&self, conversation_id: i64) -> ProviderResult<()> {
        let builder = self.request(Method::DELETE, &conversation_path(conversation_id));
        self.send(builder, "delete-conversation").await?;
        tracing::info!(conversation_id, "conversation deleted");
        Ok(())
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> ProviderResult<Conversation> {
        let path = format!("{}/title", conversation_path(conversation_id));
        let builder = self
            .request(Method::PATCH, &path)
            .query(&[("title", title)]);
        self.send_json(builder, "rename-conversation").await
    }
}
