use std::sync::Mutex;

use flowforge_core::traits::ExecutionObserver;
use flowforge_core::types::{ExecutionResult, NodeStatus};

/// One observer callback, as recorded by [`RecordingObserver`].
#[derive(Debug, Clone)]
pub enum ObservedEvent {
    Start {
        run_id: String,
        order: Vec<String>,
    },
    Status {
        node_id: String,
        status: NodeStatus,
        message: Option<String>,
    },
    AgentIteration {
        node_id: String,
        iteration: usize,
        tool: Option<String>,
    },
    Complete(ExecutionResult),
    Error {
        run_id: String,
        message: String,
    },
}

/// Observer that records every callback in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Every status a node passed through, in order.
    pub fn statuses_for(&self, node_id: &str) -> Vec<NodeStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Status {
                    node_id: id,
                    status,
                    ..
                } if id == node_id => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn agent_iterations(&self) -> Vec<(usize, Option<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::AgentIteration {
                    iteration, tool, ..
                } => Some((iteration, tool)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Error { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ObservedEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_execution_start(&self, run_id: &str, order: &[String]) {
        self.push(ObservedEvent::Start {
            run_id: run_id.to_string(),
            order: order.to_vec(),
        });
    }

    fn on_node_status_change(
        &self,
        _run_id: &str,
        node_id: &str,
        status: NodeStatus,
        message: Option<&str>,
    ) {
        self.push(ObservedEvent::Status {
            node_id: node_id.to_string(),
            status,
            message: message.map(str::to_string),
        });
    }

    fn on_agent_iteration(&self, node_id: &str, iteration: usize, tool: Option<&str>) {
        self.push(ObservedEvent::AgentIteration {
            node_id: node_id.to_string(),
            iteration,
            tool: tool.map(str::to_string),
        });
    }

    fn on_execution_complete(&self, result: &ExecutionResult) {
        self.push(ObservedEvent::Complete(result.clone()));
    }

    fn on_execution_error(&self, run_id: &str, error: &str) {
        self.push(ObservedEvent::Error {
            run_id: run_id.to_string(),
            message: error.to_string(),
        });
    }
}
