use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use flowforge_core::config::AppConfig;
use flowforge_core::error::Result;
use flowforge_core::graph::{Graph, Node, NodeKind};
use flowforge_core::traits::*;
use flowforge_core::types::{NodeOutcome, ResultTable};

use crate::agent_loop::AgentStrategy;
use crate::strategies::{
    CodeToolStrategy, HttpToolStrategy, MemoryMarkerStrategy, ModelChatStrategy,
    ModelEmbedStrategy, ModelVisionStrategy, SimulatedStrategy, TriggerStrategy,
};

/// Everything a strategy may look at while executing one node.
pub struct DispatchContext<'a> {
    pub node: &'a Node,
    pub graph: &'a Graph,
    /// Results of nodes that succeeded earlier in this run.
    pub results: &'a ResultTable,
    /// Result of the first upstream data node with a result, or the tool
    /// call arguments when invoked from an agent.
    pub prior_input: Value,
    /// The dispatcher itself, for strategies that execute other nodes.
    pub dispatcher: &'a NodeDispatcher,
    pub observer: &'a dyn ExecutionObserver,
}

/// Executes nodes of one kind.
pub trait NodeStrategy: Send + Sync + 'static {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>>;
}

/// External collaborators available to the default strategies.
///
/// A strategy whose collaborator is missing fails its node with a
/// `MissingService` error rather than refusing to build.
#[derive(Clone, Default)]
pub struct Services {
    pub chat: Option<Arc<dyn ChatService>>,
    pub embedding: Option<Arc<dyn EmbeddingService>>,
    pub vision: Option<Arc<dyn VisionService>>,
    pub http: Option<Arc<dyn HttpProxy>>,
    pub sandbox: Option<Arc<dyn CodeSandbox>>,
    pub memory: Option<Arc<dyn MemoryStore>>,
}

impl Services {
    pub fn with_chat(mut self, chat: Arc<dyn ChatService>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_embedding(mut self, embedding: Arc<dyn EmbeddingService>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionService>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpProxy>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }
}

/// Fallback values for node settings a node's config leaves out.
#[derive(Debug, Clone)]
pub struct StrategyDefaults {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub embedding_model: Option<String>,
    pub vision_model: Option<String>,
    pub max_iterations: usize,
    pub memory_window: usize,
    pub simulated_delay: Duration,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            embedding_model: None,
            vision_model: None,
            max_iterations: 5,
            memory_window: 10,
            simulated_delay: Duration::from_millis(500),
        }
    }
}

impl StrategyDefaults {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut defaults = Self {
            max_iterations: config.engine.max_iterations.max(1),
            memory_window: config.engine.memory_window,
            simulated_delay: Duration::from_millis(config.engine.simulated_delay_ms),
            ..Self::default()
        };
        if let Some(model) = &config.model {
            defaults.model = model.model_id.clone();
            defaults.temperature = model.temperature;
            defaults.max_tokens = model.max_tokens;
            defaults.embedding_model = model.embedding_model.clone();
            defaults.vision_model = model.vision_model.clone();
        }
        defaults
    }
}

/// Registry of per-kind strategies with an explicit fallback.
pub struct NodeDispatcher {
    strategies: HashMap<NodeKind, Arc<dyn NodeStrategy>>,
    fallback: Arc<dyn NodeStrategy>,
}

impl NodeDispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// A dispatcher with every built-in strategy registered.
    pub fn with_defaults(services: Services, defaults: StrategyDefaults) -> Self {
        DispatcherBuilder::with_defaults(services, defaults).build()
    }

    /// Whether a dedicated strategy is registered for `kind`.
    pub fn handles(&self, kind: &NodeKind) -> bool {
        self.strategies.contains_key(kind)
    }

    /// Execute a node with its prior input taken from upstream results.
    pub async fn execute(
        &self,
        node: &Node,
        graph: &Graph,
        results: &ResultTable,
        observer: &dyn ExecutionObserver,
    ) -> NodeOutcome {
        let prior_input = prior_input(graph, &node.id, results);
        self.execute_with_input(node, graph, results, prior_input, observer)
            .await
    }

    /// Execute a node with an explicit prior input.
    ///
    /// Never fails: strategy errors and panics become a failed outcome.
    pub async fn execute_with_input(
        &self,
        node: &Node,
        graph: &Graph,
        results: &ResultTable,
        prior_input: Value,
        observer: &dyn ExecutionObserver,
    ) -> NodeOutcome {
        let strategy = self.strategies.get(&node.kind).unwrap_or(&self.fallback);
        debug!(node_id = %node.id, kind = %node.kind, "Dispatching node");

        let ctx = DispatchContext {
            node,
            graph,
            results,
            prior_input,
            dispatcher: self,
            observer,
        };

        match AssertUnwindSafe(strategy.execute(ctx)).catch_unwind().await {
            Ok(Ok(data)) => NodeOutcome::success(data),
            Ok(Err(e)) => NodeOutcome::failure(e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(node_id = %node.id, panic = %message, "Node strategy panicked");
                NodeOutcome::failure(format!("Node execution panicked: {message}"))
            }
        }
    }
}

/// Result of the first upstream node wired on a data port that has a result.
pub fn prior_input(graph: &Graph, node_id: &str, results: &ResultTable) -> Value {
    graph
        .edges_into(node_id)
        .filter(|e| e.to_port.is_data())
        .find_map(|e| results.get(&e.from_node_id))
        .cloned()
        .unwrap_or(Value::Null)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Default)]
pub struct DispatcherBuilder {
    strategies: HashMap<NodeKind, Arc<dyn NodeStrategy>>,
    fallback: Option<Arc<dyn NodeStrategy>>,
}

impl DispatcherBuilder {
    /// Start from the built-in strategy table.
    pub fn with_defaults(services: Services, defaults: StrategyDefaults) -> Self {
        let trigger: Arc<dyn NodeStrategy> = Arc::new(TriggerStrategy);
        Self::default()
            .register(NodeKind::Trigger, trigger.clone())
            .register(NodeKind::Webhook, trigger.clone())
            .register(NodeKind::Schedule, trigger)
            .register(
                NodeKind::Memory,
                Arc::new(MemoryMarkerStrategy::new(defaults.memory_window)),
            )
            .register(
                NodeKind::ModelChat,
                Arc::new(ModelChatStrategy::new(services.chat.clone(), defaults.clone())),
            )
            .register(
                NodeKind::ModelEmbed,
                Arc::new(ModelEmbedStrategy::new(
                    services.embedding.clone(),
                    defaults.embedding_model.clone(),
                )),
            )
            .register(
                NodeKind::ModelVision,
                Arc::new(ModelVisionStrategy::new(
                    services.vision.clone(),
                    defaults.vision_model.clone(),
                )),
            )
            .register(NodeKind::HttpTool, Arc::new(HttpToolStrategy::new(services.http.clone())))
            .register(NodeKind::CodeTool, Arc::new(CodeToolStrategy::new(services.sandbox.clone())))
            .register(
                NodeKind::Agent,
                Arc::new(AgentStrategy::new(services.chat, services.memory, defaults.clone())),
            )
            .fallback(Arc::new(SimulatedStrategy::new(defaults.simulated_delay)))
    }

    /// Register (or replace) the strategy for a kind.
    pub fn register(mut self, kind: NodeKind, strategy: Arc<dyn NodeStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// Strategy for kinds with no registered strategy.
    pub fn fallback(mut self, strategy: Arc<dyn NodeStrategy>) -> Self {
        self.fallback = Some(strategy);
        self
    }

    pub fn build(self) -> NodeDispatcher {
        let fallback: Arc<dyn NodeStrategy> = match self.fallback {
            Some(strategy) => strategy,
            None => Arc::new(SimulatedStrategy::new(StrategyDefaults::default().simulated_delay)),
        };
        NodeDispatcher {
            strategies: self.strategies,
            fallback,
        }
    }
}
