use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::{Graph, Node};
use flowforge_core::traits::{ExecutionObserver, NoopObserver};
use flowforge_core::types::*;

use crate::dispatcher::NodeDispatcher;
use crate::order::{build_order, ExecutionOrder};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Drives a graph run node by node.
///
/// Lifecycle: `idle → running ⇄ paused → completed | error`, and `reset`
/// back to idle from anywhere. Control methods take `&self` and only flip
/// flags; the driver observes them between nodes, so a node that is in
/// flight always runs to completion.
pub struct ExecutionController {
    dispatcher: Arc<NodeDispatcher>,
    observer: Arc<dyn ExecutionObserver>,
    history_limit: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    state: ExecutionState,
    /// Bumped on every start/stop/reset. A driver whose generation is stale
    /// never writes.
    generation: u64,
    /// Whether a driver is currently looping for this generation.
    driving: bool,
    run: Option<RunContext>,
    history: Vec<ExecutionResult>,
}

/// Per-run tables, rebuilt at every start.
struct RunContext {
    run_id: String,
    graph: Arc<Graph>,
    order: Vec<String>,
    cursor: usize,
    statuses: HashMap<String, NodeStatus>,
    results: ResultTable,
    logs: Vec<ExecutionLogEntry>,
    failures: Vec<String>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

/// Observer callbacks collected under the lock and fired after it is released.
enum Notice {
    Started { run_id: String, order: Vec<String> },
    Status {
        run_id: String,
        node_id: String,
        status: NodeStatus,
        message: Option<String>,
    },
    Completed(Box<ExecutionResult>),
    Failed { run_id: String, message: String },
}

enum Step {
    Run {
        node: Node,
        graph: Arc<Graph>,
        results: ResultTable,
    },
    Continue,
    Yield,
}

impl RunContext {
    fn new(graph: Arc<Graph>, order: Vec<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            graph,
            order,
            cursor: 0,
            statuses: HashMap::new(),
            results: ResultTable::new(),
            logs: Vec::new(),
            failures: Vec::new(),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn transition(
        &mut self,
        node: &Node,
        status: NodeStatus,
        message: Option<String>,
        duration_ms: Option<u64>,
        notices: &mut Vec<Notice>,
    ) {
        self.statuses.insert(node.id.clone(), status);

        let mut entry = ExecutionLogEntry::new(&node.id, node.display_name(), status);
        if let Some(msg) = &message {
            entry = entry.with_message(msg.clone());
        }
        if let Some(ms) = duration_ms {
            entry = entry.with_duration(ms);
        }
        self.logs.push(entry);

        notices.push(Notice::Status {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            status,
            message,
        });
    }

    fn record(&mut self, node: &Node, outcome: NodeOutcome, duration_ms: u64, notices: &mut Vec<Notice>) {
        if outcome.success {
            debug!(node_id = %node.id, duration_ms, "Node succeeded");
            self.results
                .insert(node.id.clone(), outcome.data.unwrap_or(serde_json::Value::Null));
            self.transition(node, NodeStatus::Success, None, Some(duration_ms), notices);
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "Node execution failed".to_string());
            warn!(node_id = %node.id, error = %error, duration_ms, "Node failed");
            self.failures.push(format!("{}: {}", node.display_name(), error));
            self.transition(node, NodeStatus::Error, Some(error), Some(duration_ms), notices);
        }
    }

    /// Why `node` must be skipped, if it must.
    fn skip_reason(&self, node: &Node) -> Option<String> {
        if node.deactivated {
            return Some("Node is deactivated".to_string());
        }
        for upstream_id in self.graph.upstream_ids(&node.id) {
            let Some(upstream) = self.graph.node(upstream_id) else {
                continue;
            };
            if upstream.deactivated {
                return Some(format!(
                    "Upstream node '{}' is deactivated",
                    upstream.display_name()
                ));
            }
            if self.statuses.get(upstream_id) == Some(&NodeStatus::Error) {
                return Some(format!("Upstream node '{}' failed", upstream.display_name()));
            }
        }
        None
    }

    fn finish(&self) -> ExecutionResult {
        let failed = self.statuses.values().any(|s| *s == NodeStatus::Error);
        ExecutionResult {
            id: self.run_id.clone(),
            start_time: self.started_at,
            end_time: Utc::now(),
            duration_ms: self.clock.elapsed().as_millis() as u64,
            final_status: if failed {
                ExecutionState::Error
            } else {
                ExecutionState::Completed
            },
            node_statuses: self.statuses.clone(),
            logs: self.logs.clone(),
            error: failed.then(|| self.failures.join("; ")),
        }
    }
}

impl ExecutionController {
    pub fn new(dispatcher: Arc<NodeDispatcher>) -> Self {
        Self {
            dispatcher,
            observer: Arc::new(NoopObserver),
            history_limit: DEFAULT_HISTORY_LIMIT,
            inner: Mutex::new(Inner {
                state: ExecutionState::Idle,
                generation: 0,
                driving: false,
                run: None,
                history: Vec::new(),
            }),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run and drive it until it completes, pauses, or is stopped.
    ///
    /// Returns the controller state at the moment driving yielded.
    pub async fn start(&self, graph: Graph) -> Result<ExecutionState> {
        let mut notices = Vec::new();
        let generation = {
            let mut inner = self.lock();
            if !inner.state.can_start() {
                return Err(FlowError::InvalidTransition {
                    action: "start",
                    state: inner.state.to_string(),
                });
            }

            let ExecutionOrder { order, excluded } = build_order(&graph);
            let graph = Arc::new(graph);
            let mut run = RunContext::new(graph.clone(), order);

            for node in graph.nodes().iter().filter(|n| !n.deactivated) {
                run.statuses.insert(node.id.clone(), NodeStatus::Waiting);
            }

            info!(
                run_id = %run.run_id,
                nodes = graph.nodes().len(),
                ordered = run.order.len(),
                "Execution started"
            );
            notices.push(Notice::Started {
                run_id: run.run_id.clone(),
                order: run.order.clone(),
            });

            for node_id in &excluded {
                if let Some(node) = graph.node(node_id) {
                    warn!(run_id = %run.run_id, node_id = %node_id, "Node excluded from execution order");
                    run.transition(
                        node,
                        NodeStatus::Skipped,
                        Some("not reachable in execution order (cycle)".to_string()),
                        None,
                        &mut notices,
                    );
                }
            }

            inner.generation += 1;
            inner.state = ExecutionState::Running;
            inner.driving = true;
            inner.run = Some(run);
            inner.generation
        };
        self.notify(notices);

        self.drive(generation).await;
        Ok(self.state())
    }

    /// Halt before the next node. Valid only while running.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != ExecutionState::Running {
            return Err(FlowError::InvalidTransition {
                action: "pause",
                state: inner.state.to_string(),
            });
        }
        inner.state = ExecutionState::Paused;
        info!("Execution paused");
        Ok(())
    }

    /// Continue a paused run at the next unprocessed node.
    ///
    /// If the driver that was paused is still finishing its in-flight node,
    /// it simply carries on and this returns immediately.
    pub async fn resume(&self) -> Result<ExecutionState> {
        let generation = {
            let mut inner = self.lock();
            if inner.state != ExecutionState::Paused {
                return Err(FlowError::InvalidTransition {
                    action: "resume",
                    state: inner.state.to_string(),
                });
            }
            inner.state = ExecutionState::Running;
            info!("Execution resumed");
            if inner.driving {
                return Ok(ExecutionState::Running);
            }
            inner.driving = true;
            inner.generation
        };

        self.drive(generation).await;
        Ok(self.state())
    }

    /// Abandon the run. Finished node work is kept; no further node runs and
    /// no history entry is written.
    pub fn stop(&self) -> Result<()> {
        let mut notices = Vec::new();
        {
            let mut inner = self.lock();
            if !inner.state.is_active() {
                return Err(FlowError::InvalidTransition {
                    action: "stop",
                    state: inner.state.to_string(),
                });
            }
            inner.state = ExecutionState::Idle;
            inner.generation += 1;
            inner.driving = false;

            if let Some(run) = inner.run.as_mut() {
                let graph = run.graph.clone();
                let in_flight: Vec<&Node> = graph
                    .nodes()
                    .iter()
                    .filter(|n| run.statuses.get(&n.id) == Some(&NodeStatus::Running))
                    .collect();
                for node in in_flight {
                    run.transition(
                        node,
                        NodeStatus::Skipped,
                        Some("Execution stopped".to_string()),
                        None,
                        &mut notices,
                    );
                }
                info!(run_id = %run.run_id, processed = run.cursor, "Execution stopped");
            }
        }
        self.notify(notices);
        Ok(())
    }

    /// Clear per-run state and return to idle. History is kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = ExecutionState::Idle;
        inner.generation += 1;
        inner.driving = false;
        inner.run = None;
        debug!("Execution reset");
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock().run.as_ref().map(|r| r.run_id.clone())
    }

    /// Execution order of the current run.
    pub fn order(&self) -> Vec<String> {
        self.lock()
            .run
            .as_ref()
            .map(|r| r.order.clone())
            .unwrap_or_default()
    }

    pub fn node_statuses(&self) -> HashMap<String, NodeStatus> {
        self.lock()
            .run
            .as_ref()
            .map(|r| r.statuses.clone())
            .unwrap_or_default()
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.lock()
            .run
            .as_ref()
            .and_then(|r| r.statuses.get(node_id).copied())
    }

    pub fn results(&self) -> ResultTable {
        self.lock()
            .run
            .as_ref()
            .map(|r| r.results.clone())
            .unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<ExecutionLogEntry> {
        self.lock()
            .run
            .as_ref()
            .map(|r| r.logs.clone())
            .unwrap_or_default()
    }

    /// Finished runs, most recent first.
    pub fn history(&self) -> Vec<ExecutionResult> {
        self.lock().history.clone()
    }

    async fn drive(&self, generation: u64) {
        loop {
            let mut notices = Vec::new();
            let step = {
                let mut inner = self.lock();
                self.next_step(&mut inner, generation, &mut notices)
            };
            self.notify(notices);

            let (node, graph, results) = match step {
                Step::Run {
                    node,
                    graph,
                    results,
                } => (node, graph, results),
                Step::Continue => continue,
                Step::Yield => return,
            };

            let started = Instant::now();
            let outcome = self
                .dispatcher
                .execute(&node, &graph, &results, self.observer.as_ref())
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let mut notices = Vec::new();
            {
                let mut inner = self.lock();
                if inner.generation != generation {
                    debug!(node_id = %node.id, "Discarding result from superseded run");
                    return;
                }
                let Some(run) = inner.run.as_mut() else {
                    return;
                };
                run.record(&node, outcome, duration_ms, &mut notices);
                run.cursor += 1;
            }
            self.notify(notices);
        }
    }

    /// Decide what the driver does next. Runs entirely under the lock.
    fn next_step(&self, inner: &mut Inner, generation: u64, notices: &mut Vec<Notice>) -> Step {
        if inner.generation != generation {
            return Step::Yield;
        }
        let Inner {
            state,
            driving,
            run,
            history,
            ..
        } = inner;

        if *state != ExecutionState::Running {
            *driving = false;
            return Step::Yield;
        }
        let Some(run) = run.as_mut() else {
            *driving = false;
            return Step::Yield;
        };

        if run.cursor >= run.order.len() {
            let result = run.finish();
            info!(
                run_id = %result.id,
                status = %result.final_status,
                duration_ms = result.duration_ms,
                "Execution finished"
            );
            *state = result.final_status;
            *driving = false;
            history.insert(0, result.clone());
            history.truncate(self.history_limit);
            let failure = result.error.clone().map(|message| Notice::Failed {
                run_id: result.id.clone(),
                message,
            });
            notices.push(Notice::Completed(Box::new(result)));
            notices.extend(failure);
            return Step::Yield;
        }

        let graph = run.graph.clone();
        let node_id = run.order[run.cursor].clone();
        let Some(node) = graph.node(&node_id) else {
            run.cursor += 1;
            return Step::Continue;
        };

        if let Some(reason) = run.skip_reason(node) {
            debug!(node_id = %node.id, reason = %reason, "Skipping node");
            run.transition(node, NodeStatus::Skipped, Some(reason), None, notices);
            run.cursor += 1;
            return Step::Continue;
        }

        run.transition(node, NodeStatus::Running, None, None, notices);
        Step::Run {
            node: node.clone(),
            graph: graph.clone(),
            results: run.results.clone(),
        }
    }

    fn notify(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Started { run_id, order } => {
                    self.observer.on_execution_start(&run_id, &order)
                }
                Notice::Status {
                    run_id,
                    node_id,
                    status,
                    message,
                } => self
                    .observer
                    .on_node_status_change(&run_id, &node_id, status, message.as_deref()),
                Notice::Completed(result) => self.observer.on_execution_complete(&result),
                Notice::Failed { run_id, message } => {
                    self.observer.on_execution_error(&run_id, &message)
                }
            }
        }
    }
}
