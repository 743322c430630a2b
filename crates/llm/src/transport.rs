use std::time::Duration;

use futures::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};

use super::provider::{
    BackendConfig, BoxFuture, BuildHttpClientSnafu, ByteChunkStream, ChatBackend, ChatRequest,
    ConnectSnafu, DecodeResponseSnafu, EmptyMessageSetSnafu, MissingBaseUrlSnafu, ProviderError,
    ProviderResult, TransportStatusSnafu,
};

pub const CHAT_PATH: &str = "/prompt/chat";
const USER_AGENT: &str = concat!("chatline/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the chat backend.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    config: BackendConfig,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> ProviderResult<Self> {
        ensure!(
            !config.base_url.is_empty(),
            MissingBaseUrlSnafu {
                stage: "backend-client-new",
            }
        );

        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context(BuildHttpClientSnafu {
            stage: "build-http-client",
        })?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Returns a client sharing this connection pool but sending a different credential.
    pub fn with_access_token(&self, token: impl Into<String>) -> Self {
        Self {
            config: self.config.clone().with_access_token(token),
            http: self.http.clone(),
        }
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.config.endpoint(path));
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) async fn send(
        &self,
        builder: RequestBuilder,
        stage: &'static str,
    ) -> ProviderResult<Response> {
        let response = builder.send().await.context(ConnectSnafu { stage })?;
        ensure_success(response, stage).await
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        stage: &'static str,
    ) -> ProviderResult<T> {
        let response = self.send(builder, stage).await?;
        response.json::<T>().await.context(DecodeResponseSnafu { stage })
    }

    /// Issues one streaming chat POST and exposes the body as raw chunks.
    ///
    /// The returned stream owns the response; the connection is released when it is
    /// dropped, whether the read finished, failed, or was abandoned.
    pub async fn open_chat_stream(&self, request: &ChatRequest) -> ProviderResult<ByteChunkStream> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "open-chat-stream",
            }
        );

        let builder = self
            .request(Method::POST, CHAT_PATH)
            .json(&request.body(true));
        let response = match self.send(builder, "open-chat-stream").await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    model_id = %request.model_id,
                    status = ?error.status(),
                    error = %error,
                    "failed to open chat stream"
                );
                return Err(error);
            }
        };

        tracing::info!(
            model_id = %request.model_id,
            message_count = request.messages.len(),
            conversation_id = ?request.conversation_id,
            "chat stream opened"
        );

        let chunks = response.bytes_stream().map(|item| {
            item.map_err(|source| ProviderError::StreamRead {
                stage: "read-chat-stream",
                details: source.to_string(),
            })
        });
        Ok(chunks.boxed())
    }
}

impl ChatBackend for BackendClient {
    fn open_stream<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, ProviderResult<ByteChunkStream>> {
        Box::pin(self.open_chat_stream(request))
    }
}

async fn ensure_success(response: Response, stage: &'static str) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    TransportStatusSnafu {
        stage,
        status: status.as_u16(),
        body,
    }
    .fail()
}
