//! Built-in strategies, one per node kind.

mod code;
mod http;
mod model;
mod passthrough;
mod simulated;

pub use code::CodeToolStrategy;
pub use http::HttpToolStrategy;
pub(crate) use model::ChatSettings;
pub use model::{ModelChatStrategy, ModelEmbedStrategy, ModelVisionStrategy};
pub use passthrough::{MemoryMarkerStrategy, TriggerStrategy};
pub use simulated::SimulatedStrategy;

use serde_json::Value;

use crate::dispatcher::DispatchContext;
use crate::template;

/// A config string with placeholders resolved, if set and non-empty.
pub(crate) fn resolved_config(ctx: &DispatchContext<'_>, key: &str) -> Option<String> {
    ctx.node
        .config_str(key)
        .map(|raw| template::resolve_str(raw, ctx.results))
        .filter(|s| !s.trim().is_empty())
}

/// A config string, falling back to the node's prior input rendered as text.
pub(crate) fn text_input(ctx: &DispatchContext<'_>, key: &str) -> Option<String> {
    resolved_config(ctx, key).or_else(|| match &ctx.prior_input {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        other => Some(template::render(other)),
    })
}
