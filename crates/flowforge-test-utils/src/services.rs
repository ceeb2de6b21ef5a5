use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use flowforge_core::error::Result;
use flowforge_core::traits::{
    ChatService, CodeSandbox, EmbeddingService, HttpProxy, VisionService,
};
use flowforge_core::types::*;

/// Chat service that replies from a fixed script and records every request.
///
/// Once the script runs out, further calls get a failed response.
pub struct ScriptedChat {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatService for ScriptedChat {
    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            Ok(next.unwrap_or_else(|| ChatResponse::failed("script exhausted")))
        })
    }
}

/// Embedding service that returns the same vector for any input.
pub struct StaticEmbedding {
    vector: Vec<f32>,
    inputs: Mutex<Vec<String>>,
}

impl StaticEmbedding {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

impl EmbeddingService for StaticEmbedding {
    fn embed(&self, text: String, _model: Option<String>) -> BoxFuture<'_, Result<EmbeddingResponse>> {
        self.inputs.lock().unwrap().push(text);
        let vector = self.vector.clone();
        Box::pin(async move { Ok(EmbeddingResponse::ok(vec![vector])) })
    }
}

/// Vision service with a canned description.
pub struct StaticVision {
    text: String,
    calls: Mutex<usize>,
}

impl StaticVision {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl VisionService for StaticVision {
    fn vision(
        &self,
        _prompt: String,
        _image: String,
        _model: Option<String>,
    ) -> BoxFuture<'_, Result<VisionResponse>> {
        *self.calls.lock().unwrap() += 1;
        let text = self.text.clone();
        Box::pin(async move { Ok(VisionResponse::ok(text)) })
    }
}

/// HTTP proxy that answers every request with one response.
pub struct RecordingHttpProxy {
    response: HttpResponse,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingHttpProxy {
    pub fn new(response: HttpResponse) -> Self {
        Self {
            response,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 200 with the given body.
    pub fn ok(body: &str) -> Self {
        Self::new(HttpResponse {
            success: true,
            status_code: 200,
            body: body.to_string(),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpProxy for RecordingHttpProxy {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        self.requests.lock().unwrap().push(request);
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

type SandboxFn = dyn Fn(String, Value, ResultTable) -> Result<Value> + Send + Sync;

/// Sandbox backed by a closure instead of a real interpreter.
pub struct FnSandbox {
    run: Box<SandboxFn>,
}

impl FnSandbox {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(String, Value, ResultTable) -> Result<Value> + Send + Sync + 'static,
    {
        Self { run: Box::new(run) }
    }
}

impl CodeSandbox for FnSandbox {
    fn run(
        &self,
        code: String,
        prior_input: Value,
        results: ResultTable,
    ) -> BoxFuture<'_, Result<Value>> {
        let outcome = (self.run)(code, prior_input, results);
        Box::pin(async move { outcome })
    }
}
