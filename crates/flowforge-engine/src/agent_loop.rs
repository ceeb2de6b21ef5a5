//! Bounded tool-calling loop for `agent` nodes.
//!
//! Tools are the nodes wired into the agent's `tool` port. The model calls
//! one by replying with `<tool_call>name({...json args...})</tool_call>`;
//! the tool node then runs through the same dispatcher as every other node,
//! and its outcome is fed back as a user turn. Session memory comes from an
//! optional node on the `memory` port.
//!
//! While a tool node runs, the call arguments are visible to its templates as
//! `{{args.field}}`. `args` is therefore a reserved result key: a node with
//! that id is shadowed for the duration of the call.

use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::{Node, Port};
use flowforge_core::traits::{ChatService, MemoryStore};
use flowforge_core::types::{ChatMessage, ResultTable, Usage};

use crate::dispatcher::{DispatchContext, NodeStrategy, StrategyDefaults};
use crate::strategies::{resolved_config, text_input, ChatSettings};

/// Result-table key holding the current tool call's arguments.
pub const TOOL_ARGS_KEY: &str = "args";

/// Session settings read off a memory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySession {
    pub session_id: String,
    pub window: usize,
    pub clear_on_run: bool,
}

impl MemorySession {
    pub fn from_node(node: &Node, default_window: usize) -> Self {
        Self {
            session_id: node
                .config_str("sessionId")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-session", node.id)),
            window: node
                .config_u64("windowSize")
                .map(|w| w as usize)
                .unwrap_or(default_window),
            clear_on_run: node.config_bool("clearOnRun"),
        }
    }
}

/// A tool node as advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolManifest {
    pub fn from_node(node: &Node) -> Self {
        let name = node
            .config_str("toolName")
            .or_else(|| node.config_str("name"))
            .unwrap_or(&node.id)
            .to_string();
        let description = node
            .config_str("description")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Runs the {} node '{}'", node.kind, node.display_name()));
        let parameters = node
            .config_value("parameters")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"}));
        Self {
            name,
            description,
            parameters,
        }
    }
}

/// A tool call parsed out of a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// One executed tool call, as reported in the agent's result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool: String,
    pub args: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn tool_call_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<tool_call>\s*([A-Za-z0-9_.\-]+)\s*\((.*?)\)\s*</tool_call>")
            .expect("tool call pattern is valid")
    })
}

/// Find the first tagged tool call in `text`.
///
/// Empty arguments become `{}`; arguments that are not valid JSON are
/// passed through as a string.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let caps = tool_call_pattern().captures(text)?;
    let name = caps[1].to_string();
    let raw = caps[2].trim();
    let args = if raw.is_empty() {
        json!({})
    } else {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    };
    Some(ToolCall { name, args })
}

/// Instruction block appended to the system prompt when tools are wired.
pub fn tool_instructions(tools: &[ToolManifest]) -> String {
    let mut out = String::from("You have access to the following tools:\n");
    for tool in tools {
        out.push_str(&format!(
            "\n- {}: {}\n  Parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out.push_str(
        "\nTo use a tool, reply with exactly one call in this format:\n\
         <tool_call>tool_name({\"arg\": \"value\"})</tool_call>\n\
         You will receive the tool result in the next message. \
         When you have the final answer, reply without a tool call.",
    );
    out
}

/// Strategy for `agent` nodes.
pub struct AgentStrategy {
    chat: Option<Arc<dyn ChatService>>,
    memory: Option<Arc<dyn MemoryStore>>,
    defaults: StrategyDefaults,
}

impl AgentStrategy {
    pub fn new(
        chat: Option<Arc<dyn ChatService>>,
        memory: Option<Arc<dyn MemoryStore>>,
        defaults: StrategyDefaults,
    ) -> Self {
        Self {
            chat,
            memory,
            defaults,
        }
    }

    async fn run(&self, ctx: DispatchContext<'_>) -> Result<Value> {
        let chat = self.chat.as_ref().ok_or(FlowError::MissingService("chat"))?;
        let node = ctx.node;

        // Memory: the first node wired into the memory port, if a store exists
        let session = match ctx.graph.sources_on_port(&node.id, &Port::Memory).first() {
            Some(memory_node) => match &self.memory {
                Some(store) => Some((
                    store,
                    MemorySession::from_node(memory_node, self.defaults.memory_window),
                )),
                None => {
                    warn!(node_id = %node.id, "Memory node wired but no memory store configured");
                    None
                }
            },
            None => None,
        };

        let tool_nodes = ctx.graph.sources_on_port(&node.id, &Port::Tool);
        let tools: Vec<(ToolManifest, &Node)> = tool_nodes
            .into_iter()
            .map(|n| (ToolManifest::from_node(n), n))
            .collect();

        let prompt = text_input(&ctx, "prompt")
            .ok_or_else(|| FlowError::node_config("Agent node requires a prompt"))?;

        let mut system_prompt = resolved_config(&ctx, "systemPrompt").unwrap_or_default();
        if !tools.is_empty() {
            let manifests: Vec<ToolManifest> = tools.iter().map(|(m, _)| m.clone()).collect();
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&tool_instructions(&manifests));
        }
        let system_prompt = (!system_prompt.is_empty()).then_some(system_prompt);

        let mut messages = Vec::new();
        if let Some((store, session)) = &session {
            if session.clear_on_run {
                store.clear(&session.session_id).await?;
            }
            let history = store.load(&session.session_id, session.window).await?;
            debug!(
                node_id = %node.id,
                session_id = %session.session_id,
                loaded = history.len(),
                "Loaded agent memory"
            );
            messages.extend(history);
        }
        messages.push(ChatMessage::user(prompt.clone()));

        let max_iterations = node
            .config_u64("maxIterations")
            .map(|n| n as usize)
            .unwrap_or(self.defaults.max_iterations)
            .max(1);
        let settings = ChatSettings::from_node(node, &self.defaults);

        let mut usage = Usage::default();
        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut final_text = String::new();
        let mut iterations = 0;

        while iterations < max_iterations {
            iterations += 1;
            let response = chat
                .chat(settings.request(messages.clone(), system_prompt.clone()))
                .await?;
            if !response.success {
                return Err(FlowError::service(
                    response.error.unwrap_or_else(|| "Chat request failed".to_string()),
                ));
            }
            if let Some(u) = &response.usage {
                usage.accumulate(u);
            }
            let text = response.text.unwrap_or_default();
            final_text = text.clone();

            // Without tools the response is never inspected
            if tools.is_empty() {
                ctx.observer.on_agent_iteration(&node.id, iterations, None);
                break;
            }

            let Some(call) = parse_tool_call(&text) else {
                ctx.observer.on_agent_iteration(&node.id, iterations, None);
                break;
            };
            let Some((_, tool_node)) = tools.iter().find(|(m, _)| m.name == call.name) else {
                warn!(node_id = %node.id, tool = %call.name, "Model called an unknown tool");
                ctx.observer.on_agent_iteration(&node.id, iterations, None);
                break;
            };

            info!(node_id = %node.id, tool = %call.name, iteration = iterations, "Agent calling tool");
            ctx.observer
                .on_agent_iteration(&node.id, iterations, Some(call.name.as_str()));

            let mut tool_results: ResultTable = ctx.results.clone();
            if tool_results
                .insert(TOOL_ARGS_KEY.to_string(), call.args.clone())
                .is_some()
            {
                warn!(
                    node_id = %node.id,
                    tool = %call.name,
                    "Result of node 'args' is shadowed by tool call arguments"
                );
            }
            let outcome = ctx
                .dispatcher
                .execute_with_input(
                    tool_node,
                    ctx.graph,
                    &tool_results,
                    call.args.clone(),
                    ctx.observer,
                )
                .await;

            let feedback = if outcome.success {
                let data = outcome.data.clone().unwrap_or(Value::Null);
                format!("Tool result for {}:\n{}", call.name, data)
            } else {
                let error = outcome.error.clone().unwrap_or_default();
                warn!(node_id = %node.id, tool = %call.name, error = %error, "Tool node failed");
                format!("Tool {} failed: {}", call.name, error)
            };

            tool_calls.push(ToolCallRecord {
                tool: call.name,
                args: call.args,
                success: outcome.success,
                result: outcome.data,
                error: outcome.error,
            });
            messages.push(ChatMessage::assistant(text));
            messages.push(ChatMessage::user(feedback));
        }

        if let Some((store, session)) = &session {
            store
                .save(
                    &session.session_id,
                    &[ChatMessage::user(prompt), ChatMessage::assistant(final_text.clone())],
                )
                .await?;
        }

        info!(
            node_id = %node.id,
            iterations,
            tool_calls = tool_calls.len(),
            total_tokens = usage.total_tokens,
            "Agent finished"
        );

        let mut result = json!({
            "text": final_text,
            "usage": usage,
            "iterations": iterations,
            "toolCount": tools.len(),
        });
        if let Value::Object(map) = &mut result {
            if node.config_bool("reportToolCalls") {
                map.insert("toolCalls".to_string(), serde_json::to_value(&tool_calls)?);
            }
            if let Some((_, session)) = &session {
                map.insert("memorySessionId".to_string(), json!(session.session_id));
            }
        }
        Ok(result)
    }
}

impl NodeStrategy for AgentStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(self.run(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use flowforge_core::graph::{Edge, Graph, NodeKind};
    use flowforge_core::traits::NoopObserver;
    use flowforge_core::types::{ChatResponse, HttpResponse, Role};
    use flowforge_test_utils::{InMemoryStore, RecordingHttpProxy, RecordingObserver, ScriptedChat};

    use crate::dispatcher::{NodeDispatcher, Services};

    fn defaults() -> StrategyDefaults {
        StrategyDefaults {
            simulated_delay: Duration::ZERO,
            ..StrategyDefaults::default()
        }
    }

    fn agent(id: &str) -> Node {
        Node::new(id, NodeKind::Agent).with_config("prompt", json!("What is the weather?"))
    }

    #[test]
    fn test_parse_tool_call() {
        let call = parse_tool_call(
            "Let me check.\n<tool_call>weather({\"city\": \"Paris (FR)\"})</tool_call> done",
        )
        .unwrap();
        assert_eq!(call.name, "weather");
        assert_eq!(call.args, json!({"city": "Paris (FR)"}));

        assert_eq!(
            parse_tool_call("<tool_call> ping() </tool_call>").unwrap().args,
            json!({})
        );
        assert_eq!(
            parse_tool_call("<tool_call>echo(not json)</tool_call>").unwrap().args,
            json!("not json")
        );
        assert!(parse_tool_call("no calls here").is_none());
        assert!(parse_tool_call("<tool_call>broken").is_none());
    }

    #[test]
    fn test_manifest_naming() {
        let named = Node::new("n1", NodeKind::HttpTool)
            .with_config("toolName", json!("search"))
            .with_config("name", json!("Search API"));
        assert_eq!(ToolManifest::from_node(&named).name, "search");

        let by_name = Node::new("n2", NodeKind::HttpTool).with_config("name", json!("lookup"));
        assert_eq!(ToolManifest::from_node(&by_name).name, "lookup");

        let bare = Node::new("n3", NodeKind::CodeTool);
        let manifest = ToolManifest::from_node(&bare);
        assert_eq!(manifest.name, "n3");
        assert_eq!(manifest.parameters, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_zero_tools_never_parses() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ChatResponse::ok("<tool_call>weather({})</tool_call>", None),
            ChatResponse::ok("unused", None),
        ]));
        let node = agent("a");
        let graph = Graph::new(vec![node.clone()], vec![]);
        let dispatcher =
            NodeDispatcher::with_defaults(Services::default().with_chat(chat.clone()), defaults());

        let outcome = dispatcher
            .execute(&node, &graph, &ResultTable::new(), &NoopObserver)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["text"], json!("<tool_call>weather({})</tool_call>"));
        assert_eq!(data["iterations"], json!(1));
        assert_eq!(data["toolCount"], json!(0));
        assert_eq!(chat.requests().len(), 1);
        assert!(chat.requests()[0].system_prompt.is_none());
    }

    #[tokio::test]
    async fn test_tool_loop_executes_tool_node() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ChatResponse::ok(
                "<tool_call>weather({\"city\": \"Oslo\"})</tool_call>",
                Some(Usage::new(10, 5)),
            ),
            ChatResponse::ok("It is sunny in Oslo.", Some(Usage::new(20, 6))),
        ]));
        let proxy = Arc::new(RecordingHttpProxy::new(HttpResponse {
            success: true,
            status_code: 200,
            body: r#"{"sky":"clear"}"#.to_string(),
        }));
        let graph = Graph::new(
            vec![
                Node::new("w", NodeKind::HttpTool)
                    .with_config("toolName", json!("weather"))
                    .with_config("url", json!("https://wx.test/{{args.city}}")),
                agent("a")
                    .with_config("systemPrompt", json!("Be brief."))
                    .with_config("reportToolCalls", json!(true)),
            ],
            vec![Edge::tool("e", "w", "a")],
        );
        let services = Services::default()
            .with_chat(chat.clone())
            .with_http(proxy.clone());
        let dispatcher = NodeDispatcher::with_defaults(services, defaults());
        let observer = RecordingObserver::new();

        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &observer)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["text"], json!("It is sunny in Oslo."));
        assert_eq!(data["iterations"], json!(2));
        assert_eq!(data["toolCount"], json!(1));
        assert_eq!(data["usage"]["totalTokens"], json!(41));
        assert_eq!(data["toolCalls"][0]["tool"], json!("weather"));
        assert_eq!(data["toolCalls"][0]["success"], json!(true));

        assert_eq!(proxy.requests()[0].url, "https://wx.test/Oslo");

        let requests = chat.requests();
        let system = requests[0].system_prompt.as_deref().unwrap();
        assert!(system.starts_with("Be brief."));
        assert!(system.contains("- weather:"));
        assert!(system.contains("<tool_call>"));

        // Second call carries the assistant turn and the tool result
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, Role::Assistant);
        assert_eq!(second[2].role, Role::User);
        assert!(second[2].content.contains("\"sky\":\"clear\""));

        assert_eq!(observer.agent_iterations(), vec![(1, Some("weather".to_string())), (2, None)]);
    }

    #[tokio::test]
    async fn test_tool_args_shadow_node_named_args_only_during_call() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ChatResponse::ok("<tool_call>lookup({\"q\": \"rust\"})</tool_call>", None),
            ChatResponse::ok("done", None),
        ]));
        let proxy = Arc::new(RecordingHttpProxy::ok("{}"));
        let graph = Graph::new(
            vec![
                Node::new("args", NodeKind::Trigger),
                Node::new("kb", NodeKind::HttpTool)
                    .with_config("toolName", json!("lookup"))
                    .with_config("url", json!("https://kb.test/{{args.q}}")),
                agent("a"),
            ],
            vec![Edge::data("e1", "args", "a"), Edge::tool("e2", "kb", "a")],
        );
        let services = Services::default()
            .with_chat(chat.clone())
            .with_http(proxy.clone());
        let dispatcher = NodeDispatcher::with_defaults(services, defaults());

        let mut results = ResultTable::new();
        results.insert("args".into(), json!({"q": "from-node"}));
        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &results, &NoopObserver)
            .await;
        assert!(outcome.success);

        assert_eq!(proxy.requests()[0].url, "https://kb.test/rust");
        assert_eq!(results["args"], json!({"q": "from-node"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_final_answer() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok(
            "<tool_call>teleport({})</tool_call>",
            None,
        )]));
        let graph = Graph::new(
            vec![Node::new("w", NodeKind::HttpTool), agent("a")],
            vec![Edge::tool("e", "w", "a")],
        );
        let dispatcher =
            NodeDispatcher::with_defaults(Services::default().with_chat(chat.clone()), defaults());
        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &NoopObserver)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["iterations"], json!(1));
        assert_eq!(data["text"], json!("<tool_call>teleport({})</tool_call>"));
        assert!(data.get("toolCalls").is_none());
    }

    #[tokio::test]
    async fn test_failed_tool_is_folded_into_conversation() {
        let chat = Arc::new(ScriptedChat::new(vec![
            ChatResponse::ok("<tool_call>w({})</tool_call>", None),
            ChatResponse::ok("The tool was unavailable.", None),
        ]));
        // No http proxy: the tool node fails with a missing service
        let graph = Graph::new(
            vec![
                Node::new("w", NodeKind::HttpTool).with_config("url", json!("https://x")),
                agent("a"),
            ],
            vec![Edge::tool("e", "w", "a")],
        );
        let dispatcher =
            NodeDispatcher::with_defaults(Services::default().with_chat(chat.clone()), defaults());
        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &NoopObserver)
            .await;
        assert!(outcome.success);
        let feedback = &chat.requests()[1].messages[2].content;
        assert!(feedback.contains("Tool w failed: No http service configured"));
    }

    #[tokio::test]
    async fn test_single_iteration_returns_last_text() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok(
            "<tool_call>w({})</tool_call>",
            None,
        )]));
        let proxy = Arc::new(RecordingHttpProxy::ok("{}"));
        let graph = Graph::new(
            vec![
                Node::new("w", NodeKind::HttpTool).with_config("url", json!("https://x")),
                agent("a").with_config("maxIterations", json!(1)),
            ],
            vec![Edge::tool("e", "w", "a")],
        );
        let services = Services::default().with_chat(chat.clone()).with_http(proxy);
        let dispatcher = NodeDispatcher::with_defaults(services, defaults());
        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &NoopObserver)
            .await;
        let data = outcome.data.unwrap();
        assert_eq!(data["iterations"], json!(1));
        assert!(!data["text"].as_str().unwrap().is_empty());
        assert_eq!(chat.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_chat_failure_aborts_node() {
        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::failed("model overloaded")]));
        let node = agent("a");
        let graph = Graph::new(vec![node.clone()], vec![]);
        let dispatcher =
            NodeDispatcher::with_defaults(Services::default().with_chat(chat), defaults());
        let outcome = dispatcher
            .execute(&node, &graph, &ResultTable::new(), &NoopObserver)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("model overloaded"));
    }

    #[tokio::test]
    async fn test_memory_loaded_and_saved() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save("chat-1", &[ChatMessage::user("Hi, I'm Ada"), ChatMessage::assistant("Hello Ada")])
            .await
            .unwrap();

        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok("You are Ada.", None)]));
        let graph = Graph::new(
            vec![
                Node::new("mem", NodeKind::Memory)
                    .with_config("sessionId", json!("chat-1"))
                    .with_config("windowSize", json!(1)),
                Node::new("a", NodeKind::Agent).with_config("prompt", json!("Who am I?")),
            ],
            vec![Edge::memory("e", "mem", "a")],
        );
        let services = Services::default()
            .with_chat(chat.clone())
            .with_memory(store.clone());
        let dispatcher = NodeDispatcher::with_defaults(services, defaults());
        let outcome = dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &NoopObserver)
            .await;
        assert_eq!(outcome.data.unwrap()["memorySessionId"], json!("chat-1"));

        // Window of one: only the latest stored message precedes the prompt
        let sent = &chat.requests()[0].messages;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].content, "Hello Ada");
        assert_eq!(sent[1].content, "Who am I?");

        let saved = store.load("chat-1", 10).await.unwrap();
        assert_eq!(saved.len(), 4);
        assert_eq!(saved[3], ChatMessage::assistant("You are Ada."));
    }

    #[tokio::test]
    async fn test_clear_on_run() {
        let store = Arc::new(InMemoryStore::new());
        store.save("mem-session", &[ChatMessage::user("old")]).await.unwrap();

        let chat = Arc::new(ScriptedChat::new(vec![ChatResponse::ok("fresh", None)]));
        let graph = Graph::new(
            vec![
                Node::new("mem", NodeKind::Memory).with_config("clearOnRun", json!(true)),
                agent("a"),
            ],
            vec![Edge::memory("e", "mem", "a")],
        );
        let services = Services::default()
            .with_chat(chat.clone())
            .with_memory(store.clone());
        let dispatcher = NodeDispatcher::with_defaults(services, defaults());
        dispatcher
            .execute(graph.node("a").unwrap(), &graph, &ResultTable::new(), &NoopObserver)
            .await;

        assert_eq!(chat.requests()[0].messages.len(), 1);
        assert_eq!(store.load("mem-session", 10).await.unwrap().len(), 2);
    }
}
