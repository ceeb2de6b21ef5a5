use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::CodeSandbox;

use crate::dispatcher::{DispatchContext, NodeStrategy};

/// Runs `config.code` in the sandbox with the node's prior input and a
/// snapshot of the results table.
pub struct CodeToolStrategy {
    sandbox: Option<Arc<dyn CodeSandbox>>,
}

impl CodeToolStrategy {
    pub fn new(sandbox: Option<Arc<dyn CodeSandbox>>) -> Self {
        Self { sandbox }
    }
}

impl NodeStrategy for CodeToolStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let code = ctx
                .node
                .config_str("code")
                .ok_or_else(|| FlowError::node_config("Code node requires code"))?;
            let sandbox = self
                .sandbox
                .as_ref()
                .ok_or(FlowError::MissingService("code sandbox"))?;

            debug!(node_id = %ctx.node.id, bytes = code.len(), "Running code node");
            sandbox
                .run(code.to_string(), ctx.prior_input, ctx.results.clone())
                .await
        })
    }
}
