use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde_json::Value;

/// Raises a runtime error for every message it receives
pub struct FailNode {
    message: String,
}

impl Node for FailNode {
    fn node_type(&self) -> &str {
        "fail"
    }

    fn on_input(&self, _msg: Message, _ctx: &NodeContext) -> Result<(), NodeError> {
        Err(NodeError::ExecutionFailed(self.message.clone()))
    }
}

pub struct FailNodeFactory;

impl NodeFactory for FailNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let message = config
            .property("message")
            .and_then(Value::as_str)
            .unwrap_or("failed")
            .to_string();
        Ok(Box::new(FailNode { message }))
    }

    fn node_type(&self) -> &str {
        "fail"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Raise an error for each message".to_string(),
            category: "common".to_string(),
            inputs: vec![PortDefinition::new("in", "message to fail")],
            outputs: vec![],
        }
    }
}
