use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::*;

/// Chat completion service used by model-chat and agent nodes.
pub trait ChatService: Send + Sync + 'static {
    /// Send a full conversation and receive the assistant reply.
    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>>;
}

/// Text embedding service used by model-embed nodes.
pub trait EmbeddingService: Send + Sync + 'static {
    fn embed(&self, text: String, model: Option<String>) -> BoxFuture<'_, Result<EmbeddingResponse>>;
}

/// Image understanding service used by model-vision nodes.
pub trait VisionService: Send + Sync + 'static {
    fn vision(
        &self,
        prompt: String,
        image: String,
        model: Option<String>,
    ) -> BoxFuture<'_, Result<VisionResponse>>;
}

/// Outbound HTTP on behalf of http-tool nodes.
pub trait HttpProxy: Send + Sync + 'static {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// Runs user code for code-tool nodes.
///
/// The code sees the node's prior input and a snapshot of all results so far,
/// and returns a JSON value.
pub trait CodeSandbox: Send + Sync + 'static {
    fn run(
        &self,
        code: String,
        prior_input: Value,
        results: ResultTable,
    ) -> BoxFuture<'_, Result<Value>>;
}

/// Session memory backend for agent nodes.
pub trait MemoryStore: Send + Sync + 'static {
    /// Load the last `window` messages of a session, oldest first.
    fn load(&self, session_id: &str, window: usize) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Append messages to a session.
    fn save(&self, session_id: &str, messages: &[ChatMessage]) -> BoxFuture<'_, Result<()>>;

    /// Drop every message of a session.
    fn clear(&self, session_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Callbacks fired synchronously by the execution controller.
///
/// All methods default to no-ops so observers implement only what they need.
pub trait ExecutionObserver: Send + Sync + 'static {
    fn on_execution_start(&self, run_id: &str, order: &[String]) {
        let _ = (run_id, order);
    }

    fn on_node_status_change(
        &self,
        run_id: &str,
        node_id: &str,
        status: NodeStatus,
        message: Option<&str>,
    ) {
        let _ = (run_id, node_id, status, message);
    }

    /// One model turn of an agent node finished; `tool` names the tool it called.
    fn on_agent_iteration(&self, node_id: &str, iteration: usize, tool: Option<&str>) {
        let _ = (node_id, iteration, tool);
    }

    fn on_execution_complete(&self, result: &ExecutionResult) {
        let _ = result;
    }

    fn on_execution_error(&self, run_id: &str, error: &str) {
        let _ = (run_id, error);
    }
}

/// Observer that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}
