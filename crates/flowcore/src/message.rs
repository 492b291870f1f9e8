use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A message travelling along wires.
///
/// The engine treats the body as opaque apart from `_msgid`, `error`,
/// `_error` and `status`, which it writes when routing signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        let mut body = Map::new();
        body.insert("_msgid".to_string(), Value::String(Uuid::new_v4().to_string()));
        Self(body)
    }

    pub fn with_payload(payload: impl Into<Value>) -> Self {
        let mut msg = Self::new();
        msg.insert("payload", payload);
        msg
    }

    /// Wraps an existing JSON object; anything else becomes the payload.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(body) => {
                let mut msg = Self(body);
                if !msg.0.contains_key("_msgid") {
                    msg.insert("_msgid", Uuid::new_v4().to_string());
                }
                msg
            }
            other => Self::with_payload(other),
        }
    }

    pub fn msgid(&self) -> Option<&str> {
        self.0.get("_msgid").and_then(Value::as_str)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get("payload")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

/// Visual status reported by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn new(fill: impl Into<String>, shape: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.into()),
            shape: Some(shape.into()),
            text: Some(text.into()),
        }
    }
}
