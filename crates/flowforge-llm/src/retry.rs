use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use flowforge_core::config::RetryConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::ChatService;
use flowforge_core::types::{ChatRequest, ChatResponse};

/// A chat service that retries transient failures with jittered backoff.
pub struct RetryingChat {
    inner: Arc<dyn ChatService>,
    retry_config: RetryConfig,
}

impl RetryingChat {
    pub fn new(inner: Arc<dyn ChatService>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &FlowError) -> bool {
    match e {
        FlowError::Service(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ChatService for RetryingChat {
    fn chat(&self, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.chat(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying chat request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flowforge_test_utils::ScriptedChat;

    /// Fails with the given message a fixed number of times, then succeeds.
    struct FlakyChat {
        failures: usize,
        message: &'static str,
        calls: AtomicUsize,
    }

    impl ChatService for FlakyChat {
        fn chat(&self, _request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if call < self.failures {
                    Err(FlowError::Service(self.message.to_string()))
                } else {
                    Ok(ChatResponse::ok("recovered", None))
                }
            })
        }
    }

    fn fast_retries(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new("m", vec![])
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&FlowError::Service("HTTP 429 Too Many Requests: slow down".into())));
        assert!(is_retryable(&FlowError::Service("operation timeout".into())));
        assert!(!is_retryable(&FlowError::Service("HTTP 401 Unauthorized: bad key".into())));
        assert!(!is_retryable(&FlowError::Config("x".into())));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        assert!(calculate_backoff(0, &config) <= Duration::from_millis(1200));
        assert!(calculate_backoff(9, &config) <= Duration::from_millis(6000));
        assert!(calculate_backoff(64, &config) <= Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let flaky = Arc::new(FlakyChat {
            failures: 2,
            message: "HTTP 503 Service Unavailable: busy",
            calls: AtomicUsize::new(0),
        });
        let chat = RetryingChat::new(flaky.clone(), fast_retries(3));
        let response = chat.chat(request()).await.unwrap();
        assert_eq!(response.text.as_deref(), Some("recovered"));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let flaky = Arc::new(FlakyChat {
            failures: 10,
            message: "HTTP 502 Bad Gateway: upstream",
            calls: AtomicUsize::new(0),
        });
        let chat = RetryingChat::new(flaky.clone(), fast_retries(2));
        assert!(chat.chat(request()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let flaky = Arc::new(FlakyChat {
            failures: 1,
            message: "HTTP 400 Bad Request: invalid model",
            calls: AtomicUsize::new(0),
        });
        let chat = RetryingChat::new(flaky.clone(), fast_retries(3));
        assert!(chat.chat(request()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_response_passes_through() {
        let scripted = Arc::new(ScriptedChat::new(vec![ChatResponse::failed("content filtered")]));
        let chat = RetryingChat::new(scripted.clone(), fast_retries(3));
        let response = chat.chat(request()).await.unwrap();
        assert!(!response.success);
        assert_eq!(scripted.requests().len(), 1);
    }
}
