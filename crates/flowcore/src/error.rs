use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural defects in a deployed configuration.
///
/// These are the only errors allowed to fail a whole `start()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Circular config node dependency detected: {id}")]
    CircularDependency { id: String },

    #[error("Duplicate node id: {0}")]
    DuplicateId(String),

    #[error("Malformed record '{id}': {reason}")]
    MalformedRecord { id: String, reason: String },

    #[error("Flow not found: {0}")]
    UnknownFlow(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Unknown node type: {0}")]
    UnknownType(String),

    #[error("Node construction failed: {0}")]
    Construction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Close failed: {0}")]
    Close(String),

    #[error("Close timed out after {millis}ms")]
    CloseTimeout { millis: u64 },
}
