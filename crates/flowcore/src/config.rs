use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub type NodeId = String;

/// Outbound wiring: one list of target ids per output port.
pub type Wires = Vec<Vec<NodeId>>;

/// A single node record of a deployed configuration.
///
/// Records are immutable once parsed; environment substitution produces a
/// new `NodeConfig` instead of editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,

    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(
        rename = "z",
        alias = "parentFlowId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_flow_id: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_wires",
        skip_serializing_if = "Option::is_none"
    )]
    pub wires: Option<Wires>,

    #[serde(rename = "d", alias = "disabled", default)]
    pub disabled: bool,

    /// Type-specific properties, opaque to the engine.
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            parent_flow_id: None,
            wires: None,
            disabled: false,
            properties: Map::new(),
        }
    }

    pub fn in_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.parent_flow_id = Some(flow_id.into());
        self
    }

    pub fn with_wires(mut self, wires: Wires) -> Self {
        self.wires = Some(wires);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Wiring as a slice, empty for nodes that declare none.
    pub fn wires(&self) -> &[Vec<NodeId>] {
        self.wires.as_deref().unwrap_or(&[])
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").and_then(Value::as_str)
    }

    /// Config nodes are shared settings objects: they carry no wiring and
    /// no editor position.
    pub fn is_config_node(&self) -> bool {
        self.wires.is_none()
            && !self.properties.contains_key("x")
            && !self.properties.contains_key("y")
    }

    /// Template id when this node is a subflow usage node (`subflow:<id>`).
    pub fn subflow_template(&self) -> Option<&str> {
        self.node_type.strip_prefix("subflow:")
    }

    /// `env` definitions declared on this record, if any.
    pub fn env_entries(&self) -> Vec<EnvEntry> {
        self.properties
            .get("env")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// One `{name, value, type}` environment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default = "default_env_kind")]
    pub kind: String,
}

fn default_env_kind() -> String {
    "str".to_string()
}

/// Reference from a subflow port to an internal node output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortWire {
    pub id: NodeId,
    #[serde(default)]
    pub port: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubflowPort {
    #[serde(default)]
    pub wires: Vec<PortWire>,
}

/// Shared, read-only definition of a subflow.
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowTemplate {
    pub id: NodeId,
    pub name: Option<String>,
    pub inputs: Vec<SubflowPort>,
    pub outputs: Vec<SubflowPort>,
    pub status: Option<SubflowPort>,
    pub complete: Option<SubflowPort>,
    pub env: Vec<EnvEntry>,
    pub nodes: Vec<NodeConfig>,
}

impl SubflowTemplate {
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub type SubflowTemplates = HashMap<NodeId, Arc<SubflowTemplate>>;

/// One independently startable graph of nodes: a tab, the global config
/// scope, or the private expansion of a subflow.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub id: String,
    pub label: Option<String>,
    pub disabled: bool,
    pub env: Vec<EnvEntry>,
    pub nodes: Vec<NodeConfig>,
    pub subflows: Arc<SubflowTemplates>,
}

impl FlowConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            disabled: false,
            env: Vec::new(),
            nodes: Vec::new(),
            subflows: Arc::new(HashMap::new()),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }
}

/// Accepts both `[["a","b"],["c"]]` and the shorthand `["a","c"]` where
/// each bare id stands for a single-target port.
fn deserialize_wires<'de, D>(deserializer: D) -> Result<Option<Wires>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        One(String),
        Many(Vec<String>),
    }

    let ports: Option<Vec<Port>> = Option::deserialize(deserializer)?;
    Ok(ports.map(|ports| {
        ports
            .into_iter()
            .map(|p| match p {
                Port::One(id) => vec![id],
                Port::Many(ids) => ids,
            })
            .collect()
    }))
}
