use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonAction {
    /// Parse strings, stringify everything else
    Toggle,
    Parse,
    Stringify,
}

/// Converts a message property between a JSON string and its value
pub struct JsonNode {
    property: String,
    action: JsonAction,
    pretty: bool,
}

impl JsonNode {
    pub fn new(config: &NodeConfig) -> Result<Self, NodeError> {
        let action = match config.property("action").and_then(Value::as_str).unwrap_or("") {
            "" => JsonAction::Toggle,
            "obj" => JsonAction::Parse,
            "str" => JsonAction::Stringify,
            other => {
                return Err(NodeError::Configuration(format!("unknown json action: {}", other)));
            }
        };
        Ok(Self {
            property: string_property(config, "property").unwrap_or_else(|| "payload".to_string()),
            action,
            pretty: config.property("pretty").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn convert(&self, value: &Value) -> Result<Option<Value>, NodeError> {
        match (value, self.action) {
            (Value::String(s), JsonAction::Toggle | JsonAction::Parse) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e))),
            (Value::String(_), JsonAction::Stringify) => Ok(None),
            (_, JsonAction::Parse) => Ok(None),
            (other, _) => {
                let text = if self.pretty {
                    serde_json::to_string_pretty(other)
                } else {
                    serde_json::to_string(other)
                };
                text.map(|t| Some(Value::String(t)))
                    .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))
            }
        }
    }
}

impl Node for JsonNode {
    fn node_type(&self) -> &str {
        "json"
    }

    fn on_input(&self, mut msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        let Some(value) = msg.get(&self.property) else {
            // Nothing to convert
            ctx.send(msg);
            return Ok(());
        };
        if let Some(converted) = self.convert(value)? {
            msg.insert(self.property.clone(), converted);
        }
        ctx.send(msg);
        Ok(())
    }
}

pub struct JsonNodeFactory;

impl NodeFactory for JsonNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonNode::new(config)?))
    }

    fn node_type(&self) -> &str {
        "json"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert between a JSON string and its value".to_string(),
            category: "parser".to_string(),
            inputs: vec![PortDefinition::new("in", "message with a property to convert")],
            outputs: vec![PortDefinition::new("out", "message with the converted property")],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
enum Rule {
    Set {
        p: String,
        #[serde(default)]
        to: Value,
        #[serde(default = "default_value_type")]
        tot: String,
    },
    Delete {
        p: String,
    },
    Move {
        p: String,
        to: String,
    },
}

fn default_value_type() -> String {
    "str".to_string()
}

/// Sets, deletes or moves message properties, one rule at a time
pub struct ChangeNode {
    rules: Vec<Rule>,
}

impl ChangeNode {
    pub fn new(config: &NodeConfig) -> Result<Self, NodeError> {
        let rules = match config.property("rules") {
            Some(rules) => serde_json::from_value(rules.clone())
                .map_err(|e| NodeError::Configuration(format!("invalid change rules: {}", e)))?,
            // Single-rule shorthand
            None => vec![Rule::Set {
                p: string_property(config, "property").unwrap_or_else(|| "payload".to_string()),
                to: config.property("value").cloned().unwrap_or(Value::Null),
                tot: string_property(config, "valueType").unwrap_or_else(default_value_type),
            }],
        };
        Ok(Self { rules })
    }

    fn apply(&self, msg: &mut Message, ctx: &NodeContext) -> Result<(), NodeError> {
        for rule in &self.rules {
            match rule {
                Rule::Set { p, to, tot } => {
                    let value = rule_value(to, tot, msg, |name| ctx.env(name))?;
                    msg.insert(p.clone(), value);
                }
                Rule::Delete { p } => {
                    msg.remove(p);
                }
                Rule::Move { p, to } => {
                    if let Some(value) = msg.remove(p) {
                        msg.insert(to.clone(), value);
                    }
                }
            }
        }
        Ok(())
    }
}

fn rule_value(
    to: &Value,
    tot: &str,
    msg: &Message,
    env: impl Fn(&str) -> Option<Value>,
) -> Result<Value, NodeError> {
    let text = || match to {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match tot {
        "str" => Ok(Value::String(text())),
        "num" => match to {
            Value::Number(_) => Ok(to.clone()),
            _ => text()
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| NodeError::ExecutionFailed(format!("not a number: {}", text()))),
        },
        "bool" => Ok(Value::Bool(matches!(to, Value::Bool(true)) || text() == "true")),
        "json" => match to {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| NodeError::ExecutionFailed(format!("invalid JSON value: {}", e))),
            other => Ok(other.clone()),
        },
        "msg" => Ok(msg.get(&text()).cloned().unwrap_or(Value::Null)),
        "env" => Ok(env(&text()).unwrap_or(Value::Null)),
        other => Err(NodeError::Configuration(format!("unknown value type: {}", other))),
    }
}

impl Node for ChangeNode {
    fn node_type(&self) -> &str {
        "change"
    }

    fn on_input(&self, mut msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        self.apply(&mut msg, ctx)?;
        ctx.send(msg);
        Ok(())
    }
}

pub struct ChangeNodeFactory;

impl NodeFactory for ChangeNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ChangeNode::new(config)?))
    }

    fn node_type(&self) -> &str {
        "change"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Set, delete or move message properties".to_string(),
            category: "function".to_string(),
            inputs: vec![PortDefinition::new("in", "message to modify")],
            outputs: vec![PortDefinition::new("out", "modified message")],
        }
    }
}

fn string_property(config: &NodeConfig, key: &str) -> Option<String> {
    config
        .property(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
