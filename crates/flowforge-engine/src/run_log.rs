use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowforge_core::event::EventBus;
use flowforge_core::types::EngineEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`, one file per run. Every line is flushed as it
/// is written, so a crash mid-run leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

struct OpenLog {
    run_id: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = + node status,
    /// 3 = + agent iterations.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until cancellation or until every
    /// publisher of the EventBus is gone.
    ///
    /// Subscribes immediately, so events published after this call are never
    /// missed even if the returned future is spawned later.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send + 'static {
        let rx = event_bus.subscribe();
        self.consume(rx, cancel)
    }

    async fn consume(self, mut rx: broadcast::Receiver<EngineEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut current: Option<OpenLog> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let EngineEvent::ExecutionStarted { run_id, .. } = &event {
                                if let Some(done) = current.take() {
                                    close(done).await;
                                }
                                current = open(&self.log_dir, run_id).await;
                            }

                            let Some(log) = current.as_mut() else {
                                continue;
                            };
                            if let Some(entry) = self.event_to_entry(&log.run_id, &event) {
                                if let Err(e) = write_entry(&mut log.writer, &entry).await {
                                    error!(error = %e, path = %log.path.display(), "Failed to write log entry");
                                }
                            }

                            if matches!(event, EngineEvent::ExecutionCompleted { .. }) {
                                // An error event follows completion for failed runs
                                if !matches!(&event, EngineEvent::ExecutionCompleted { result } if result.error.is_some()) {
                                    if let Some(done) = current.take() {
                                        close(done).await;
                                    }
                                }
                            } else if matches!(event, EngineEvent::ExecutionError { .. }) {
                                if let Some(done) = current.take() {
                                    close(done).await;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(done) = current.take() {
            close(done).await;
        }
    }

    /// Convert an engine event to a log entry (None if filtered by level).
    fn event_to_entry(&self, run_id: &str, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |event_type, node_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            EngineEvent::ExecutionStarted { node_count, .. } => Some(entry(
                "execution_started",
                None,
                Some(serde_json::json!({ "node_count": node_count })),
            )),
            EngineEvent::ExecutionCompleted { result } => Some(entry(
                "execution_completed",
                None,
                Some(serde_json::json!({
                    "final_status": result.final_status,
                    "duration_ms": result.duration_ms,
                    "nodes": result.node_statuses.len(),
                })),
            )),
            EngineEvent::ExecutionError { message, .. } => Some(entry(
                "execution_error",
                None,
                Some(serde_json::json!({ "error": message })),
            )),

            // L2: node transitions
            EngineEvent::NodeStatusChanged {
                node_id,
                status,
                message,
                ..
            } if self.level >= 2 => Some(entry(
                "node_status",
                Some(node_id),
                Some(serde_json::json!({
                    "status": status,
                    "message": message.as_deref().map(|m| truncate_str(m, 500)),
                })),
            )),

            // L3: agent iterations
            EngineEvent::AgentIteration {
                node_id,
                iteration,
                tool,
            } if self.level >= 3 => Some(entry(
                "agent_iteration",
                Some(node_id),
                Some(serde_json::json!({ "iteration": iteration, "tool": tool })),
            )),

            _ => None,
        }
    }
}

async fn open(log_dir: &Path, run_id: &str) -> Option<OpenLog> {
    let path = log_dir.join(format!("{}.jsonl", run_id));
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => {
            debug!(path = %path.display(), "Opened run log");
            Some(OpenLog {
                run_id: run_id.to_string(),
                path,
                writer: BufWriter::new(file),
            })
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open log file");
            None
        }
    }
}

async fn close(mut log: OpenLog) {
    log.writer.flush().await.ok();
    debug!(path = %log.path.display(), "Closed run log");
}

async fn write_entry(writer: &mut BufWriter<File>, entry: &LogEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    // Flush after each entry for crash resilience
    writer.flush().await
}

/// Truncate a string for logging.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use flowforge_core::types::{ExecutionResult, ExecutionState, NodeStatus};

    fn completed(run_id: &str, error: Option<&str>) -> EngineEvent {
        EngineEvent::ExecutionCompleted {
            result: Box::new(ExecutionResult {
                id: run_id.to_string(),
                start_time: Utc::now(),
                end_time: Utc::now(),
                duration_ms: 3,
                final_status: if error.is_some() {
                    ExecutionState::Error
                } else {
                    ExecutionState::Completed
                },
                node_statuses: HashMap::new(),
                logs: Vec::new(),
                error: error.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(
                "run-1",
                &EngineEvent::ExecutionStarted {
                    run_id: "run-1".to_string(),
                    node_count: 4,
                },
            )
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("execution_started"));
        assert!(json.contains("\"node_count\":4"));
        assert!(!json.contains("node_id"));
    }

    #[test]
    fn test_event_level_filtering() {
        let status = EngineEvent::NodeStatusChanged {
            run_id: "r".to_string(),
            node_id: "n".to_string(),
            status: NodeStatus::Success,
            message: None,
        };
        let iteration = EngineEvent::AgentIteration {
            node_id: "agent".to_string(),
            iteration: 1,
            tool: Some("search".to_string()),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("r", &completed("r", None)).is_some());
        assert!(l1.event_to_entry("r", &status).is_none());
        assert!(l1.event_to_entry("r", &iteration).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry("r", &status).is_some());
        assert!(l2.event_to_entry("r", &iteration).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry("r", &iteration).is_some());
    }

    #[test]
    fn test_truncate_str_char_boundary() {
        assert_eq!(truncate_str("abc", 10), "abc");
        assert_eq!(truncate_str("é€x", 3), "é");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let task = tokio::spawn(logger.run(bus.clone(), cancel.clone()));

        bus.publish(EngineEvent::ExecutionStarted {
            run_id: "run-a".to_string(),
            node_count: 1,
        });
        bus.publish(EngineEvent::NodeStatusChanged {
            run_id: "run-a".to_string(),
            node_id: "n1".to_string(),
            status: NodeStatus::Success,
            message: None,
        });
        bus.publish(completed("run-a", Some("n1: boom")));
        bus.publish(EngineEvent::ExecutionError {
            run_id: "run-a".to_string(),
            message: "n1: boom".to_string(),
        });
        bus.publish(EngineEvent::ExecutionStarted {
            run_id: "run-b".to_string(),
            node_count: 0,
        });
        bus.publish(completed("run-b", None));

        let path_b = dir.path().join("run-b.jsonl");
        for _ in 0..200 {
            if tokio::fs::metadata(&path_b).await.is_ok() {
                let content = tokio::fs::read_to_string(&path_b).await.unwrap();
                if content.lines().count() == 2 {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let run_a = std::fs::read_to_string(dir.path().join("run-a.jsonl")).unwrap();
        let types: Vec<String> = run_a
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            types,
            vec!["execution_started", "node_status", "execution_completed", "execution_error"]
        );

        let run_b = std::fs::read_to_string(path_b).unwrap();
        assert_eq!(run_b.lines().count(), 2);
    }
}
