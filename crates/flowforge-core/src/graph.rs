//! Graph model: nodes, ported edges, and read-only structural lookups.
//!
//! A `Graph` is a plain data snapshot handed to the engine for one run.
//! It performs no validation: dangling edges are kept and simply never
//! match a node, and cycles are left for the order builder to deal with.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of a node, selecting the strategy that executes it.
///
/// Unknown kind strings are preserved in `Custom` so graphs authored for
/// newer node types still load and fall through to the default strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Trigger,
    Webhook,
    Schedule,
    Memory,
    ModelChat,
    ModelEmbed,
    ModelVision,
    HttpTool,
    CodeTool,
    Agent,
    Custom(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Trigger => "trigger",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Memory => "memory",
            Self::ModelChat => "model-chat",
            Self::ModelEmbed => "model-embed",
            Self::ModelVision => "model-vision",
            Self::HttpTool => "http-tool",
            Self::CodeTool => "code-tool",
            Self::Agent => "agent",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        match s {
            "trigger" => Self::Trigger,
            "webhook" => Self::Webhook,
            "schedule" => Self::Schedule,
            "memory" => Self::Memory,
            "model-chat" => Self::ModelChat,
            "model-embed" => Self::ModelEmbed,
            "model-vision" => Self::ModelVision,
            "http-tool" => Self::HttpTool,
            "code-tool" => Self::CodeTool,
            "agent" => Self::Agent,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named endpoint on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Port {
    Input,
    #[default]
    Output,
    Tool,
    Memory,
    Custom(String),
}

impl Port {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Tool => "tool",
            Self::Memory => "memory",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Whether an edge on this port carries data (as opposed to wiring a
    /// tool or memory provider into an agent).
    pub fn is_data(&self) -> bool {
        !matches!(self, Self::Tool | Self::Memory)
    }
}

impl From<&str> for Port {
    fn from(s: &str) -> Self {
        match s {
            "input" => Self::Input,
            "output" => Self::Output,
            "tool" | "tools" => Self::Tool,
            "memory" => Self::Memory,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for Port {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.as_str().to_string()
    }
}

/// A node in the automation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: String,
    /// Kind, selecting the execution strategy.
    #[serde(alias = "type")]
    pub kind: NodeKind,
    /// Kind-specific configuration, opaque to everything but the strategy.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Deactivated nodes are skipped, and so are their direct dependents.
    #[serde(default)]
    pub deactivated: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<NodeKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: Map::new(),
            deactivated: false,
        }
    }

    /// Set a configuration value.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Mark the node as deactivated.
    pub fn deactivated(mut self) -> Self {
        self.deactivated = true;
        self
    }

    /// Human-readable name for logs: `label`, then `name`, then the id.
    pub fn display_name(&self) -> &str {
        self.config_str("label")
            .or_else(|| self.config_str("name"))
            .unwrap_or(&self.id)
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// A non-empty string config value.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn config_bool(&self, key: &str) -> bool {
        match self.config.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        }
    }
}

/// A directed, ported connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default)]
    pub from_port: Port,
    #[serde(default = "default_to_port")]
    pub to_port: Port,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_to_port() -> Port {
    Port::Input
}

impl Edge {
    /// A plain data edge `output → input`.
    pub fn data(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from_node_id: from.into(),
            to_node_id: to.into(),
            from_port: Port::Output,
            to_port: Port::Input,
            label: None,
        }
    }

    /// An edge wiring `from` into the `tool` port of `to`.
    pub fn tool(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            to_port: Port::Tool,
            ..Self::data(id, from, to)
        }
    }

    /// An edge wiring `from` into the `memory` port of `to`.
    pub fn memory(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            to_port: Port::Memory,
            ..Self::data(id, from, to)
        }
    }
}

/// An immutable view of nodes and edges for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default, alias = "connections")]
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a graph from its JSON representation.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges whose target is `node_id`.
    pub fn edges_into<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to_node_id == node_id)
    }

    /// Edges whose source is `node_id`.
    pub fn edges_out_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from_node_id == node_id)
    }

    /// Ids of nodes with an edge into `node_id`, in edge order, deduplicated.
    pub fn upstream_ids<'a>(&'a self, node_id: &'a str) -> Vec<&'a str> {
        let mut ids: Vec<&str> = Vec::new();
        for edge in self.edges_into(node_id) {
            if !ids.contains(&edge.from_node_id.as_str()) {
                ids.push(&edge.from_node_id);
            }
        }
        ids
    }

    /// Existing source nodes wired into `node_id` on the given target port.
    pub fn sources_on_port(&self, node_id: &str, port: &Port) -> Vec<&Node> {
        self.edges_into(node_id)
            .filter(|e| &e.to_port == port)
            .filter_map(|e| self.node(&e.from_node_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Graph {
        Graph::new(
            vec![
                Node::new("trigger", NodeKind::Trigger),
                Node::new("search", NodeKind::HttpTool),
                Node::new("mem", NodeKind::Memory),
                Node::new("agent", NodeKind::Agent),
            ],
            vec![
                Edge::data("e1", "trigger", "agent"),
                Edge::tool("e2", "search", "agent"),
                Edge::memory("e3", "mem", "agent"),
                Edge::data("e4", "ghost", "agent"),
            ],
        )
    }

    #[test]
    fn test_kind_roundtrip_and_custom() {
        assert_eq!(NodeKind::from("model-chat"), NodeKind::ModelChat);
        assert_eq!(
            NodeKind::from("slack-post"),
            NodeKind::Custom("slack-post".to_string())
        );
        let json = serde_json::to_string(&NodeKind::HttpTool).unwrap();
        assert_eq!(json, "\"http-tool\"");
    }

    #[test]
    fn test_parse_graph_json() {
        let graph = Graph::from_json(
            r#"{
                "nodes": [
                    {"id": "t", "kind": "trigger"},
                    {"id": "h", "type": "http-tool", "config": {"url": "https://x"}, "deactivated": true}
                ],
                "edges": [
                    {"id": "e", "fromNodeId": "t", "toNodeId": "h", "fromPort": "output", "toPort": "input"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(graph.nodes().len(), 2);
        let h = graph.node("h").unwrap();
        assert_eq!(h.kind, NodeKind::HttpTool);
        assert!(h.deactivated);
        assert_eq!(h.config_str("url"), Some("https://x"));
        assert_eq!(graph.edges()[0].to_port, Port::Input);
    }

    #[test]
    fn test_lookups() {
        let graph = sample();
        assert_eq!(graph.edges_into("agent").count(), 4);
        assert_eq!(graph.edges_out_of("trigger").count(), 1);
        assert_eq!(
            graph.upstream_ids("agent"),
            vec!["trigger", "search", "mem", "ghost"]
        );

        let tools = graph.sources_on_port("agent", &Port::Tool);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "search");

        // Dangling source is not resolved to a node
        let inputs = graph.sources_on_port("agent", &Port::Input);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].id, "trigger");
    }

    #[test]
    fn test_upstream_ids_from_owned_query() {
        let graph = sample();
        let ids: Vec<String> = {
            let target = String::from("agent");
            graph
                .upstream_ids(&target)
                .into_iter()
                .map(str::to_string)
                .collect()
        };
        assert_eq!(ids, vec!["trigger", "search", "mem", "ghost"]);

        // A node with no incoming edges has no upstream
        assert!(graph.upstream_ids("trigger").is_empty());
    }

    #[test]
    fn test_config_accessors() {
        let node = Node::new("n", NodeKind::Agent)
            .with_config("label", json!("Planner"))
            .with_config("maxIterations", json!("3"))
            .with_config("temperature", json!(0.2))
            .with_config("clearOnRun", json!(true))
            .with_config("empty", json!(""));

        assert_eq!(node.display_name(), "Planner");
        assert_eq!(node.config_u64("maxIterations"), Some(3));
        assert_eq!(node.config_f64("temperature"), Some(0.2));
        assert!(node.config_bool("clearOnRun"));
        assert!(!node.config_bool("missing"));
        assert_eq!(node.config_str("empty"), None);
        assert_eq!(Node::new("plain", "trigger").display_name(), "plain");
    }
}
