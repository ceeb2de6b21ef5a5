use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use flowforge_core::config::SandboxConfig;
use flowforge_core::error::{FlowError, Result};
use flowforge_core::traits::CodeSandbox;
use flowforge_core::types::ResultTable;

/// Runs code-tool snippets in a child interpreter process.
///
/// The process is started as `{command} {args..} {code}` and receives
/// `{"input": .., "results": ..}` as JSON on stdin. The prior input is also
/// exported as `FLOWFORGE_INPUT` when it fits in [`MAX_ENV_INPUT_BYTES`].
/// Its stdout is the node's result: parsed as JSON when it is JSON,
/// otherwise kept as a string.
/// Linux rejects any single environment string over 128 KiB.
pub const MAX_ENV_INPUT_BYTES: usize = 64 * 1024;

pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    async fn execute(&self, code: String, prior_input: Value, results: ResultTable) -> Result<Value> {
        let payload = json!({ "input": &prior_input, "results": &results }).to_string();
        let input = serde_json::to_string(&prior_input)?;

        debug!(
            command = %self.config.command,
            bytes = code.len(),
            payload_bytes = payload.len(),
            "Running sandboxed code"
        );

        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg(&code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if input.len() <= MAX_ENV_INPUT_BYTES {
            command.env("FLOWFORGE_INPUT", &input);
        }
        let mut child = command
            .spawn()
            .map_err(|e| FlowError::Sandbox(format!("{} not available: {}", self.config.command, e)))?;

        // Written from its own task: a child that never reads stdin must not
        // hold the caller past the timeout once the pipe buffer is full.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "Sandbox did not consume stdin");
                }
            })
        });

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_secs = self.config.timeout_secs, "Sandboxed code timed out");
                return Err(FlowError::SandboxTimeout(self.config.timeout_secs));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(FlowError::Sandbox(format!(
                "exit {}: {}",
                code,
                stderr.trim()
            )));
        }

        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl CodeSandbox for ProcessSandbox {
    fn run(
        &self,
        code: String,
        prior_input: Value,
        results: ResultTable,
    ) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.execute(code, prior_input, results))
    }
}

/// Whole stdout as JSON, else its last line as JSON, else the trimmed text.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return value;
    }
    trimmed
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str(l.trim()).ok())
        .unwrap_or_else(|| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(timeout_secs: u64) -> ProcessSandbox {
        ProcessSandbox::new(SandboxConfig {
            command: "sh".into(),
            args: vec!["-c".into()],
            timeout_secs,
        })
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(""), Value::Null);
        assert_eq!(parse_output("{\"a\":1}\n"), json!({"a": 1}));
        assert_eq!(parse_output("debug line\n42\n"), json!(42));
        assert_eq!(parse_output("hello world"), json!("hello world"));
    }

    #[tokio::test]
    async fn test_stdin_carries_input_and_results() {
        let mut results = ResultTable::new();
        results.insert("src".into(), json!({"n": 1}));

        let value = sh(5)
            .run("cat".into(), json!({"city": "Oslo"}), results)
            .await
            .unwrap();
        assert_eq!(value["input"]["city"], "Oslo");
        assert_eq!(value["results"]["src"]["n"], 1);
    }

    #[tokio::test]
    async fn test_input_exported_as_env() {
        let value = sh(5)
            .run("printf '%s' \"$FLOWFORGE_INPUT\"".into(), json!([1, 2]), ResultTable::new())
            .await
            .unwrap();
        assert_eq!(value, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_large_results_stay_off_the_environment() {
        let mut results = ResultTable::new();
        results.insert("big".into(), json!("x".repeat(200_000)));

        let value = sh(5)
            .run(
                "printf '%s' \"${FLOWFORGE_RESULTS:-unset}\"".into(),
                Value::Null,
                results.clone(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("unset"));

        // The full table still arrives on stdin
        let value = sh(5).run("cat".into(), Value::Null, results).await.unwrap();
        assert_eq!(value["results"]["big"].as_str().unwrap().len(), 200_000);
    }

    #[tokio::test]
    async fn test_oversized_input_not_exported() {
        let big = json!({"body": "y".repeat(MAX_ENV_INPUT_BYTES + 1)});
        let value = sh(5)
            .run(
                "printf '%s' \"${FLOWFORGE_INPUT:-unset}\"".into(),
                big,
                ResultTable::new(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("unset"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let err = sh(5)
            .run("echo boom >&2; exit 3".into(), Value::Null, ResultTable::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = sh(1)
            .run("sleep 5".into(), Value::Null, ResultTable::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SandboxTimeout(1)));
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        // Larger than a pipe buffer, and the script never reads it
        let mut results = ResultTable::new();
        results.insert("big".into(), json!("x".repeat(100_000)));

        let started = std::time::Instant::now();
        let err = sh(1)
            .run("sleep 3".into(), Value::Null, results)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SandboxTimeout(1)));
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let sandbox = ProcessSandbox::new(SandboxConfig {
            command: "definitely-not-an-interpreter".into(),
            args: vec![],
            timeout_secs: 1,
        });
        let err = sandbox
            .run("x".into(), Value::Null, ResultTable::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Sandbox(_)));
    }
}
