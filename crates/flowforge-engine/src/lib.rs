pub mod agent_loop;
pub mod controller;
pub mod dispatcher;
pub mod order;
pub mod run_log;
pub mod strategies;
pub mod template;

pub use agent_loop::{AgentStrategy, ToolCall, ToolManifest};
pub use controller::ExecutionController;
pub use dispatcher::{
    DispatchContext, DispatcherBuilder, NodeDispatcher, NodeStrategy, Services, StrategyDefaults,
};
pub use order::{build_order, ExecutionOrder};
pub use run_log::RunLogger;
