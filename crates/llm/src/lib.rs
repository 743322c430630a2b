mod auth;
mod completion;
mod conversations;
mod decoder;
mod model;
mod provider;
#[cfg(test)]
mod test_support;
mod transport;

pub use auth::{LoginCredentials, RegisterCredentials, Token, User};
pub use completion::{CompletionResponse, PromptRequest, Usage};
pub use conversations::{
    Conversation, ConversationSummary, DEFAULT_PAGE_SIZE, NewConversation, StoredMessage,
};
pub use decoder::{
    DATA_PREFIX, FRAME_DELIMITER, FrameDecoder, StreamEvent, TERMINATOR_PAYLOAD, decode_stream,
};
pub use model::{
    DEFAULT_MODEL, Model, ModelCatalog, ModelCatalogSource, default_models, is_known_model,
};
pub use provider::{
    BackendConfig, BoxFuture, ByteChunkStream, ChatBackend, ChatRequest, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE, ProviderError, ProviderMessage, ProviderResult, Role,
};
pub use transport::BackendClient;
