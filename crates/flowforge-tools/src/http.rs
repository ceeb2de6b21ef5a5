use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowforge_core::config::HttpConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::HttpProxy;
use flowforge_core::types::{HttpRequest, HttpResponse};

/// Outbound HTTP for http-tool nodes, backed by reqwest.
///
/// Non-2xx answers are returned as unsuccessful responses, not errors; only
/// transport failures surface as `Err`.
pub struct ReqwestHttpProxy {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl ReqwestHttpProxy {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FlowError::Service(e.to_string()))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }
}

impl HttpProxy for ReqwestHttpProxy {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let method = request
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| FlowError::node_config(format!("Invalid method: {}", e)))?;

            debug!(method = %method, url = %request.url, "Proxying HTTP request");
            let mut req = self.client.request(method, &request.url);
            for (k, v) in &request.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = request.body {
                req = req.body(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowError::Service(format!("{}: {}", request.url, e)))?;
            let status = resp.status();
            let mut body = resp.text().await.unwrap_or_default();
            truncate_body(&mut body, self.max_body_bytes);

            Ok(HttpResponse {
                success: status.is_success(),
                status_code: status.as_u16(),
                body,
            })
        })
    }
}

fn truncate_body(body: &mut String, max: usize) {
    if body.len() <= max {
        return;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body.truncate(end);
}
