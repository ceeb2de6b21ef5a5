use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use flowforge_core::config::ModelConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::{ChatService, EmbeddingService, VisionService};
use flowforge_core::types::*;

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, Mistral, etc.
///
/// One client backs chat, embedding and vision nodes.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.resolved_base_url(), path)
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| FlowError::Service(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(FlowError::Service(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

// Request types
#[derive(Serialize)]
struct OaiChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: Value,
}

#[derive(Serialize)]
struct OaiEmbeddingRequest {
    model: String,
    input: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct OaiChatResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct OaiChoice {
    message: OaiChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct OaiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct OaiEmbeddingResponse {
    #[serde(default)]
    data: Vec<OaiEmbedding>,
}

#[derive(Deserialize, Debug)]
struct OaiEmbedding {
    embedding: Vec<f32>,
}

/// System prompt first, then the conversation in order.
fn convert_messages(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<OaiMessage> {
    let system = system_prompt
        .filter(|s| !s.trim().is_empty())
        .map(|s| OaiMessage {
            role: "system",
            content: Value::String(s.to_string()),
        });
    system
        .into_iter()
        .chain(messages.iter().map(|m| OaiMessage {
            role: m.role.as_str(),
            content: Value::String(m.content.clone()),
        }))
        .collect()
}

fn build_chat_body(config: &ModelConfig, request: &ChatRequest) -> OaiChatRequest {
    let model = if request.model.is_empty() {
        config.model_id.clone()
    } else {
        request.model.clone()
    };
    OaiChatRequest {
        model,
        messages: convert_messages(&request.messages, request.system_prompt.as_deref()),
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        temperature: request.temperature.or(Some(config.temperature)),
    }
}

fn build_vision_body(config: &ModelConfig, prompt: &str, image: &str, model: Option<String>) -> OaiChatRequest {
    let model = model
        .or_else(|| config.vision_model.clone())
        .unwrap_or_else(|| config.model_id.clone());
    OaiChatRequest {
        model,
        messages: vec![OaiMessage {
            role: "user",
            content: json!([
                { "type": "text", "text": prompt },
                { "type": "image_url", "image_url": { "url": image } },
            ]),
        }],
        max_tokens: config.max_tokens,
        temperature: None,
    }
}

fn parse_chat(response: OaiChatResponse) -> ChatResponse {
    let usage = response
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
    match response.choices.into_iter().next() {
        Some(choice) => ChatResponse::ok(choice.message.content.unwrap_or_default(), usage),
        None => ChatResponse::failed("Model returned no choices"),
    }
}

impl ChatService for OpenAiClient {
    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        Box::pin(async move {
            let body = build_chat_body(&self.config, &request);
            debug!(model = %body.model, messages = body.messages.len(), "Sending chat request");
            let response: OaiChatResponse = self
                .post("chat/completions", &body)
                .await?
                .json()
                .await
                .map_err(|e| FlowError::Service(e.to_string()))?;
            Ok(parse_chat(response))
        })
    }
}

impl EmbeddingService for OpenAiClient {
    fn embed(&self, text: String, model: Option<String>) -> BoxFuture<'_, Result<EmbeddingResponse>> {
        Box::pin(async move {
            let model = model
                .or_else(|| self.config.embedding_model.clone())
                .unwrap_or_else(|| "text-embedding-3-small".to_string());
            debug!(model = %model, chars = text.len(), "Sending embedding request");
            let response: OaiEmbeddingResponse = self
                .post("embeddings", &OaiEmbeddingRequest { model, input: text })
                .await?
                .json()
                .await
                .map_err(|e| FlowError::Service(e.to_string()))?;
            if response.data.is_empty() {
                return Ok(EmbeddingResponse::failed("Model returned no embeddings"));
            }
            Ok(EmbeddingResponse::ok(
                response.data.into_iter().map(|d| d.embedding).collect(),
            ))
        })
    }
}

impl VisionService for OpenAiClient {
    fn vision(
        &self,
        prompt: String,
        image: String,
        model: Option<String>,
    ) -> BoxFuture<'_, Result<VisionResponse>> {
        Box::pin(async move {
            let body = build_vision_body(&self.config, &prompt, &image, model);
            debug!(model = %body.model, "Sending vision request");
            let response: OaiChatResponse = self
                .post("chat/completions", &body)
                .await?
                .json()
                .await
                .map_err(|e| FlowError::Service(e.to_string()))?;
            let chat = parse_chat(response);
            Ok(match chat.text {
                Some(text) if chat.success => VisionResponse::ok(text),
                _ => VisionResponse::failed(chat.error.unwrap_or_default()),
            })
        })
    }
}
