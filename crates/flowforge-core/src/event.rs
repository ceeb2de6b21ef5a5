use crate::traits::ExecutionObserver;
use crate::types::{EngineEvent, ExecutionResult, NodeStatus};

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
///
/// Registered as the controller's observer, it republishes every callback as
/// an [`EngineEvent`] for async consumers.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ExecutionObserver for EventBus {
    fn on_execution_start(&self, run_id: &str, order: &[String]) {
        self.publish(EngineEvent::ExecutionStarted {
            run_id: run_id.to_string(),
            node_count: order.len(),
        });
    }

    fn on_node_status_change(
        &self,
        run_id: &str,
        node_id: &str,
        status: NodeStatus,
        message: Option<&str>,
    ) {
        self.publish(EngineEvent::NodeStatusChanged {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            status,
            message: message.map(str::to_string),
        });
    }

    fn on_agent_iteration(&self, node_id: &str, iteration: usize, tool: Option<&str>) {
        self.publish(EngineEvent::AgentIteration {
            node_id: node_id.to_string(),
            iteration,
            tool: tool.map(str::to_string),
        });
    }

    fn on_execution_complete(&self, result: &ExecutionResult) {
        self.publish(EngineEvent::ExecutionCompleted {
            result: Box::new(result.clone()),
        });
    }

    fn on_execution_error(&self, run_id: &str, error: &str) {
        self.publish(EngineEvent::ExecutionError {
            run_id: run_id.to_string(),
            message: error.to_string(),
        });
    }
}
