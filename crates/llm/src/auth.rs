use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::provider::ProviderResult;
use super::transport::BackendClient;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterCredentials {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

impl BackendClient {
    pub async fn login(&self, credentials: &LoginCredentials) -> ProviderResult<Token> {
        let builder = self.request(Method::POST, LOGIN_PATH).json(credentials);
        let token: Token = self.send_json(builder, "login").await?;
        tracing::info!(user_id = token.user.id, "logged in");
        Ok(token)
    }

    pub async fn register(&self, credentials: &RegisterCredentials) -> ProviderResult<Token> {
        let builder = self.request(Method::POST, REGISTER_PATH).json(credentials);
        let token: Token = self.send_json(builder, "register").await?;
        tracing::info!(user_id = token.user.id, "registered new account");
        Ok(token)
    }
}
