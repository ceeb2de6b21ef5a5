pub mod openai;
pub mod retry;

use std::sync::Arc;

use flowforge_core::config::ModelConfig;
use flowforge_core::traits::ChatService;

pub use openai::OpenAiClient;
pub use retry::RetryingChat;

/// Chat service for the configured provider, with retries when configured.
///
/// Every supported provider speaks the OpenAI-compatible API; the provider
/// name only selects the default base URL.
pub fn create_chat(config: &ModelConfig, client: Arc<OpenAiClient>) -> Arc<dyn ChatService> {
    let chat: Arc<dyn ChatService> = client;
    match &config.retry {
        Some(retry) => Arc::new(RetryingChat::new(chat, retry.clone())),
        None => chat,
    }
}
