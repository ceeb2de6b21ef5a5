use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::HttpProxy;
use flowforge_core::types::HttpRequest;

use super::resolved_config;
use crate::dispatcher::{DispatchContext, NodeStrategy};
use crate::template;

/// Calls an HTTP endpoint through the proxy collaborator.
pub struct HttpToolStrategy {
    http: Option<Arc<dyn HttpProxy>>,
}

impl HttpToolStrategy {
    pub fn new(http: Option<Arc<dyn HttpProxy>>) -> Self {
        Self { http }
    }
}

impl NodeStrategy for HttpToolStrategy {
    fn execute<'a>(&'a self, ctx: DispatchContext<'a>) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let url = resolved_config(&ctx, "url")
                .ok_or_else(|| FlowError::node_config("HTTP node requires a URL"))?;
            let http = self.http.as_ref().ok_or(FlowError::MissingService("http"))?;

            let method = ctx
                .node
                .config_str("method")
                .unwrap_or("GET")
                .to_uppercase();

            let mut headers: HashMap<String, String> = HashMap::new();
            if let Some(Value::Object(map)) = ctx.node.config_value("headers") {
                for (name, value) in map {
                    let value = template::resolve_value(value, ctx.results);
                    headers.insert(name.clone(), template::render(&value));
                }
            }

            let body = match ctx.node.config_value("body") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if s.is_empty() => None,
                Some(Value::String(s)) => Some(template::resolve_str(s, ctx.results)),
                Some(structured) => {
                    let has_content_type = headers
                        .keys()
                        .any(|k| k.eq_ignore_ascii_case("content-type"));
                    if !has_content_type {
                        headers.insert("Content-Type".to_string(), "application/json".to_string());
                    }
                    Some(template::resolve_value(structured, ctx.results).to_string())
                }
            };

            debug!(node_id = %ctx.node.id, method = %method, url = %url, "HTTP tool request");
            let response = http
                .request(HttpRequest {
                    method,
                    url: url.clone(),
                    headers,
                    body,
                })
                .await?;

            if !response.success {
                return Err(FlowError::service(format!(
                    "HTTP {} from {}: {}",
                    response.status_code,
                    url,
                    preview(&response.body, 200)
                )));
            }

            // JSON bodies stay structured so templates can address fields
            let body = serde_json::from_str::<Value>(&response.body)
                .unwrap_or(Value::String(response.body));
            Ok(json!({
                "statusCode": response.status_code,
                "body": body,
                "url": url,
            }))
        })
    }
}

fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
