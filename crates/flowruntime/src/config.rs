use flowcore::{
    ConfigError, EnvEntry, FlowConfig, NodeConfig, NodeId, SubflowPort, SubflowTemplate,
    SubflowTemplates,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Id of the implicit flow that holds records without a parent flow.
pub const GLOBAL_FLOW_ID: &str = "global";

/// A flat deployment normalized into per-flow configurations.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    /// Every node record keyed by id, regardless of container
    pub all_nodes: HashMap<NodeId, NodeConfig>,
    /// Tabs in declaration order
    pub flows: Vec<FlowConfig>,
    pub global: FlowConfig,
    pub subflows: Arc<SubflowTemplates>,
}

impl ParsedConfig {
    pub fn flow(&self, id: &str) -> Option<&FlowConfig> {
        if id == GLOBAL_FLOW_ID {
            return Some(&self.global);
        }
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn flow_ids(&self) -> Vec<&str> {
        self.flows.iter().map(|f| f.id.as_str()).collect()
    }

    /// Node types that `is_known` rejects, plus usage nodes of templates
    /// that do not exist. Each type is listed once.
    pub fn missing_types(&self, is_known: impl Fn(&str) -> bool) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        let templates = self.subflows.values().flat_map(|t| t.nodes.iter());
        let nodes = self
            .global
            .nodes
            .iter()
            .chain(self.flows.iter().flat_map(|f| f.nodes.iter()))
            .chain(templates);

        for node in nodes {
            let known = match node.subflow_template() {
                Some(template) => self.subflows.contains_key(template),
                None => is_known(&node.node_type),
            };
            if !known && seen.insert(node.node_type.clone()) {
                missing.push(node.node_type.clone());
            }
        }
        missing
    }
}

#[derive(Debug, Deserialize)]
struct TabRecord {
    id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    env: Vec<EnvEntry>,
}

#[derive(Debug, Deserialize)]
struct SubflowRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "in", default)]
    inputs: Vec<SubflowPort>,
    #[serde(rename = "out", default)]
    outputs: Vec<SubflowPort>,
    #[serde(default)]
    status: Option<SubflowPort>,
    #[serde(default)]
    complete: Option<SubflowPort>,
    #[serde(default)]
    env: Vec<EnvEntry>,
}

fn record_meta(record: &Value) -> Result<(String, String), ConfigError> {
    let malformed = |id: &str, reason: &str| ConfigError::MalformedRecord {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    let object = record
        .as_object()
        .ok_or_else(|| malformed("?", "record is not an object"))?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("?", "missing id"))?;
    let node_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(id, "missing type"))?;
    Ok((id.to_string(), node_type.to_string()))
}

fn from_record<T: for<'de> Deserialize<'de>>(id: &str, record: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(record.clone()).map_err(|e| ConfigError::MalformedRecord {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Normalize a flat list of records into tabs, the global scope and
/// subflow templates.
///
/// Records are grouped by their `z` container. Records without one belong
/// to the global flow; records naming a container that does not exist are
/// skipped with a warning.
pub fn parse_config(records: &[Value]) -> Result<ParsedConfig, ConfigError> {
    let mut seen = HashSet::new();
    let mut tabs: Vec<FlowConfig> = Vec::new();
    let mut templates: Vec<SubflowTemplate> = Vec::new();
    let mut nodes: Vec<NodeConfig> = Vec::new();

    for record in records {
        let (id, node_type) = record_meta(record)?;
        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateId(id));
        }
        match node_type.as_str() {
            "tab" => {
                let tab: TabRecord = from_record(&id, record)?;
                let mut flow = FlowConfig::new(tab.id);
                flow.label = tab.label;
                flow.disabled = tab.disabled;
                flow.env = tab.env;
                tabs.push(flow);
            }
            "subflow" => {
                let sf: SubflowRecord = from_record(&id, record)?;
                templates.push(SubflowTemplate {
                    id: sf.id,
                    name: sf.name,
                    inputs: sf.inputs,
                    outputs: sf.outputs,
                    status: sf.status,
                    complete: sf.complete,
                    env: sf.env,
                    nodes: Vec::new(),
                });
            }
            _ => nodes.push(from_record(&id, record)?),
        }
    }

    let mut global = FlowConfig::new(GLOBAL_FLOW_ID);
    let mut all_nodes = HashMap::with_capacity(nodes.len());

    for node in nodes {
        all_nodes.insert(node.id.clone(), node.clone());
        match node.parent_flow_id.as_deref() {
            None => global.nodes.push(node),
            Some(z) => {
                if let Some(tab) = tabs.iter_mut().find(|t| t.id == z) {
                    tab.nodes.push(node);
                } else if let Some(template) = templates.iter_mut().find(|t| t.id == z) {
                    template.nodes.push(node);
                } else {
                    tracing::warn!("Node {} references unknown flow {}, skipping", node.id, z);
                }
            }
        }
    }

    let subflows: Arc<SubflowTemplates> = Arc::new(
        templates
            .into_iter()
            .map(|t| (t.id.clone(), Arc::new(t)))
            .collect(),
    );
    global.subflows = Arc::clone(&subflows);
    for tab in &mut tabs {
        tab.subflows = Arc::clone(&subflows);
    }

    tracing::debug!(
        "Parsed {} flows, {} subflow templates, {} global nodes",
        tabs.len(),
        subflows.len(),
        global.nodes.len()
    );

    Ok(ParsedConfig {
        all_nodes,
        flows: tabs,
        global,
        subflows,
    })
}
