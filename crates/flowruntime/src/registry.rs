use flowcore::{Node, NodeConfig, NodeError};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance from an env-resolved configuration
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, ports, etc.)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory, replacing any previous one for the type
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Build a live instance for `config`.
    ///
    /// A factory that panics is reported as a construction failure of this
    /// one node.
    pub fn create_node(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let factory = self
            .factories
            .get(&config.node_type)
            .ok_or_else(|| NodeError::UnknownType(config.node_type.clone()))?;

        match catch_unwind(AssertUnwindSafe(|| factory.create(config))) {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "factory panicked".to_string());
                Err(NodeError::Construction(reason))
            }
        }
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
