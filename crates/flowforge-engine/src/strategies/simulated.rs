use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowforge_core::error::Result;

use crate::dispatcher::{DispatchContext, NodeStrategy};

/// Fallback for kinds without a dedicated strategy: waits, then succeeds.
pub struct SimulatedStrategy {
    delay: Duration,
}

impl SimulatedStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl NodeStrategy for SimulatedStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            debug!(node_id = %ctx.node.id, kind = %ctx.node.kind, "Simulating node");
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(json!({
                "simulated": true,
                "nodeId": ctx.node.id,
                "kind": ctx.node.kind.as_str(),
                "message": format!("Simulated execution of {} node", ctx.node.kind),
            }))
        })
    }
}
