use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::Node;
use flowforge_core::traits::{ChatService, EmbeddingService, VisionService};
use flowforge_core::types::{ChatMessage, ChatRequest};

use super::{resolved_config, text_input};
use crate::dispatcher::{DispatchContext, NodeStrategy, StrategyDefaults};

/// Model parameters for a chat call, node config over engine defaults.
#[derive(Debug, Clone)]
pub(crate) struct ChatSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatSettings {
    pub fn from_node(node: &Node, defaults: &StrategyDefaults) -> Self {
        Self {
            model: node
                .config_str("model")
                .map(str::to_string)
                .unwrap_or_else(|| defaults.model.clone()),
            temperature: node
                .config_f64("temperature")
                .map(|t| t as f32)
                .unwrap_or(defaults.temperature),
            max_tokens: node
                .config_u64("maxTokens")
                .map(|t| t as u32)
                .unwrap_or(defaults.max_tokens),
        }
    }

    pub fn request(&self, messages: Vec<ChatMessage>, system_prompt: Option<String>) -> ChatRequest {
        ChatRequest {
            messages,
            model: self.model.clone(),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            system_prompt,
        }
    }
}

pub struct ModelChatStrategy {
    chat: Option<Arc<dyn ChatService>>,
    defaults: StrategyDefaults,
}

impl ModelChatStrategy {
    pub fn new(chat: Option<Arc<dyn ChatService>>, defaults: StrategyDefaults) -> Self {
        Self { chat, defaults }
    }
}

impl NodeStrategy for ModelChatStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let chat = self.chat.as_ref().ok_or(FlowError::MissingService("chat"))?;
            let prompt = text_input(&ctx, "prompt")
                .ok_or_else(|| FlowError::node_config("Chat node requires a prompt"))?;
            let system_prompt = resolved_config(&ctx, "systemPrompt");
            let settings = ChatSettings::from_node(ctx.node, &self.defaults);

            debug!(node_id = %ctx.node.id, model = %settings.model, "Calling chat service");
            let response = chat
                .chat(settings.request(vec![ChatMessage::user(prompt)], system_prompt))
                .await?;
            if !response.success {
                return Err(FlowError::service(
                    response.error.unwrap_or_else(|| "Chat request failed".to_string()),
                ));
            }

            Ok(json!({
                "text": response.text.unwrap_or_default(),
                "usage": response.usage,
                "model": settings.model,
            }))
        })
    }
}

pub struct ModelEmbedStrategy {
    embedding: Option<Arc<dyn EmbeddingService>>,
    default_model: Option<String>,
}

impl ModelEmbedStrategy {
    pub fn new(embedding: Option<Arc<dyn EmbeddingService>>, default_model: Option<String>) -> Self {
        Self {
            embedding,
            default_model,
        }
    }
}

impl NodeStrategy for ModelEmbedStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let embedding = self
                .embedding
                .as_ref()
                .ok_or(FlowError::MissingService("embedding"))?;
            let input = text_input(&ctx, "input")
                .ok_or_else(|| FlowError::node_config("Embedding node requires input text"))?;
            let model = ctx
                .node
                .config_str("model")
                .map(str::to_string)
                .or_else(|| self.default_model.clone());

            let response = embedding.embed(input, model.clone()).await?;
            if !response.success {
                return Err(FlowError::service(
                    response.error.unwrap_or_else(|| "Embedding request failed".to_string()),
                ));
            }

            let embeddings = response.embeddings.unwrap_or_default();
            let dimensions = embeddings.first().map(Vec::len).unwrap_or(0);
            Ok(json!({
                "embeddings": embeddings,
                "dimensions": dimensions,
                "model": model,
            }))
        })
    }
}

pub struct ModelVisionStrategy {
    vision: Option<Arc<dyn VisionService>>,
    default_model: Option<String>,
}

impl ModelVisionStrategy {
    pub fn new(vision: Option<Arc<dyn VisionService>>, default_model: Option<String>) -> Self {
        Self {
            vision,
            default_model,
        }
    }
}

impl NodeStrategy for ModelVisionStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            // Validate before touching the service
            let image = resolved_config(&ctx, "imageUrl")
                .or_else(|| resolved_config(&ctx, "image"))
                .ok_or_else(|| FlowError::node_config("Vision node requires an image URL"))?;
            let vision = self.vision.as_ref().ok_or(FlowError::MissingService("vision"))?;
            let prompt = resolved_config(&ctx, "prompt")
                .unwrap_or_else(|| "Describe this image.".to_string());
            let model = ctx
                .node
                .config_str("model")
                .map(str::to_string)
                .or_else(|| self.default_model.clone());

            let response = vision.vision(prompt, image, model.clone()).await?;
            if !response.success {
                return Err(FlowError::service(
                    response.error.unwrap_or_else(|| "Vision request failed".to_string()),
                ));
            }

            Ok(json!({
                "text": response.text.unwrap_or_default(),
                "model": model,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::graph::{Edge, Graph, NodeKind};
    use flowforge_core::traits::NoopObserver;
    use flowforge_core::types::{ChatResponse, ResultTable, Role, Usage};
    use flowforge_test_utils::{ScriptedChat, StaticEmbedding, StaticVision};

    use crate::dispatcher::{NodeDispatcher, Services};

    fn dispatcher(services: Services) -> NodeDispatcher {
        NodeDispatcher::with_defaults(services, StrategyDefaults::default())
    }

    #[tokio::test]
    async fn test_chat_resolves_prompt_and_reports_usage() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok(
            "bonjour",
            Some(Usage::new(7, 3)),
        )]));
        let node = Node::new("chat", NodeKind::ModelChat)
            .with_config("prompt", json!("Translate {{t.word}}"))
            .with_config("systemPrompt", json!("You translate."))
            .with_config("model", json!("small-model"));
        let graph = Graph::new(vec![node.clone()], vec![]);
        let mut results = ResultTable::new();
        results.insert("t".into(), json!({"word": "hello"}));

        let outcome = dispatcher(Services::default().with_chat(chat.clone()))
            .execute(&node, &graph, &results, &NoopObserver)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["text"], json!("bonjour"));
        assert_eq!(data["usage"]["totalTokens"], json!(10));
        assert_eq!(data["model"], json!("small-model"));

        let requests = chat.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::User);
        assert_eq!(requests[0].messages[0].content, "Translate hello");
        assert_eq!(requests[0].system_prompt.as_deref(), Some("You translate."));
    }

    #[tokio::test]
    async fn test_chat_falls_back_to_prior_input() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok("ok", None)]));
        let graph = Graph::new(
            vec![
                Node::new("up", NodeKind::Trigger),
                Node::new("chat", NodeKind::ModelChat),
            ],
            vec![Edge::data("e", "up", "chat")],
        );
        let mut results = ResultTable::new();
        results.insert("up".into(), json!("summarise this"));

        let node = graph.node("chat").unwrap();
        let outcome = dispatcher(Services::default().with_chat(chat.clone()))
            .execute(node, &graph, &results, &NoopObserver)
            .await;
        assert!(outcome.success);
        assert_eq!(chat.requests()[0].messages[0].content, "summarise this");
    }

    #[tokio::test]
    async fn test_chat_failure_surfaces_service_error() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::failed("rate limited")]));
        let node = Node::new("chat", NodeKind::ModelChat).with_config("prompt", json!("hi"));
        let graph = Graph::new(vec![node.clone()], vec![]);
        let outcome = dispatcher(Services::default().with_chat(chat))
            .execute(&node, &graph, &ResultTable::new(), &NoopObserver)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_embed_reports_dimensions() {
        let embedding = Arc::new(StaticEmbedding::new(vec![0.1, 0.2, 0.3]));
        let node = Node::new("emb", NodeKind::ModelEmbed).with_config("input", json!("about {{t.topic}}"));
        let graph = Graph::new(vec![node.clone()], vec![]);
        let mut results = ResultTable::new();
        results.insert("t".into(), json!({"topic": "rust"}));
        let outcome = dispatcher(Services::default().with_embedding(embedding.clone()))
            .execute(&node, &graph, &results, &NoopObserver)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["dimensions"], json!(3));
        assert_eq!(embedding.inputs(), vec!["about rust".to_string()]);
    }

    #[tokio::test]
    async fn test_vision_requires_image_before_calling() {
        let vision = Arc::new(StaticVision::new("a cat"));
        let node = Node::new("vis", NodeKind::ModelVision)
            .with_config("imageUrl", json!("{{missing.url}}"))
            .with_config("prompt", json!("What is it?"));
        let graph = Graph::new(vec![node.clone()], vec![]);
        let d = dispatcher(Services::default().with_vision(vision.clone()));

        // Unresolved placeholder is still a non-empty string, so the call goes out
        let outcome = d.execute(&node, &graph, &ResultTable::new(), &NoopObserver).await;
        assert!(outcome.success);
        assert_eq!(vision.calls(), 1);

        let empty = Node::new("vis2", NodeKind::ModelVision).with_config("imageUrl", json!(""));
        let outcome = d.execute(&empty, &graph, &ResultTable::new(), &NoopObserver).await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Invalid node configuration: Vision node requires an image URL")
        );
        assert_eq!(vision.calls(), 1);
    }
}
