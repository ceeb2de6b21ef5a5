use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowforge_core::error::Result;

use crate::agent_loop::MemorySession;
use crate::dispatcher::{DispatchContext, NodeStrategy};

/// Entry points (trigger, webhook, schedule) succeed immediately.
///
/// The marker payload is merged with `config.payload` when that is an
/// object, so downstream templates can read test data off the trigger.
pub struct TriggerStrategy;

impl NodeStrategy for TriggerStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut data = json!({
                "triggered": true,
                "nodeId": ctx.node.id,
                "kind": ctx.node.kind.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
            });
            if let (Some(Value::Object(payload)), Value::Object(out)) =
                (ctx.node.config_value("payload"), &mut data)
            {
                for (key, value) in payload {
                    out.insert(key.clone(), value.clone());
                }
            }
            Ok(data)
        })
    }
}

/// Memory nodes only describe their session; agents read them by edge.
pub struct MemoryMarkerStrategy {
    default_window: usize,
}

impl MemoryMarkerStrategy {
    pub fn new(default_window: usize) -> Self {
        Self { default_window }
    }
}

impl NodeStrategy for MemoryMarkerStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let session = MemorySession::from_node(ctx.node, self.default_window);
            Ok(json!({
                "memory": true,
                "sessionId": session.session_id,
                "windowSize": session.window,
            }))
        })
    }
}
