use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeStatus};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde_json::Value;

/// Logs a message property (or the whole message) at INFO
pub struct DebugNode {
    property: Option<String>,
    to_status: bool,
}

impl DebugNode {
    pub fn new(config: &NodeConfig) -> Self {
        // `complete: "true"` logs the whole message
        let property = match config.property("complete").and_then(Value::as_str) {
            Some("true") => None,
            Some(p) if !p.is_empty() => Some(p.to_string()),
            _ => Some("payload".to_string()),
        };
        let to_status = config
            .property("tostatus")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            property,
            to_status,
        }
    }

    fn render(&self, msg: &Message) -> String {
        match &self.property {
            Some(p) => match msg.get(p) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "undefined".to_string(),
            },
            None => Value::Object(msg.body().clone()).to_string(),
        }
    }
}

impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug"
    }

    fn on_input(&self, msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        let text = self.render(&msg);
        tracing::info!(node = ctx.id(), "DEBUG: {}", text);
        if self.to_status {
            let mut short = text;
            if short.len() > 32 {
                let cut = (0..=32).rev().find(|i| short.is_char_boundary(*i)).unwrap_or(0);
                short.truncate(cut);
                short.push_str("...");
            }
            ctx.status(NodeStatus::new("grey", "dot", short));
        }
        Ok(())
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode::new(config)))
    }

    fn node_type(&self) -> &str {
        "debug"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs messages for debugging".to_string(),
            category: "common".to_string(),
            inputs: vec![PortDefinition::new("in", "message to log")],
            outputs: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_the_selected_property() {
        let msg = Message::from_value(json!({"payload": "hi", "topic": {"a": 1}}));

        let payload = DebugNode::new(&NodeConfig::new("d", "debug"));
        assert_eq!(payload.render(&msg), "hi");

        let topic = DebugNode::new(&NodeConfig::new("d", "debug").with_property("complete", "topic"));
        assert_eq!(topic.render(&msg), r#"{"a":1}"#);

        let missing = DebugNode::new(&NodeConfig::new("d", "debug").with_property("complete", "nope"));
        assert_eq!(missing.render(&msg), "undefined");

        let whole = DebugNode::new(&NodeConfig::new("d", "debug").with_property("complete", "true"));
        assert!(whole.render(&msg).contains(r#""topic":{"a":1}"#));
    }
}
