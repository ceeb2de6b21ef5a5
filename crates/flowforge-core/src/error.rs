use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Collaborator errors
    #[error("Service call failed: {0}")]
    Service(String),

    #[error("No {0} service configured")]
    MissingService(&'static str),

    #[error("Code sandbox error: {0}")]
    Sandbox(String),

    #[error("Sandbox timeout after {0}s")]
    SandboxTimeout(u64),

    // Node configuration errors
    #[error("Invalid node configuration: {0}")]
    NodeConfig(String),

    // Controller errors
    #[error("Cannot {action} while execution is {state}")]
    InvalidTransition { action: &'static str, state: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a node configuration error.
    pub fn node_config(msg: impl Into<String>) -> Self {
        Self::NodeConfig(msg.into())
    }

    /// Shorthand for a collaborator failure.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
