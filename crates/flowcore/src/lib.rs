//! Core abstractions for the flow engine
//!
//! This crate provides the configuration data model, the node lifecycle
//! contract and the runtime event bus that the engine and node libraries
//! share.

mod config;
mod error;
pub mod events;
mod message;
mod node;

pub use config::{
    EnvEntry, FlowConfig, NodeConfig, NodeId, PortWire, SubflowPort, SubflowTemplate,
    SubflowTemplates, Wires,
};
pub use error::{ConfigError, FlowError, NodeError};
pub use events::*;
pub use message::{Message, NodeStatus};
pub use node::{CloseSignal, Completion, Node, NodeContext, NodeLink};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
