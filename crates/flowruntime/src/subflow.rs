use crate::flow::Flow;
use flowcore::{
    EnvEntry, Message, Node, NodeConfig, NodeContext, NodeError, NodeId, SubflowTemplate, Wires,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Entry node of an expansion, receives what the usage node is sent.
pub const INPUT_TYPE: &str = "subflow-in";
pub const STATUS_SINK_TYPE: &str = "subflow-status";
pub const COMPLETE_SINK_TYPE: &str = "subflow-complete";

pub fn is_internal_type(node_type: &str) -> bool {
    matches!(node_type, INPUT_TYPE | STATUS_SINK_TYPE | COMPLETE_SINK_TYPE)
}

fn private_id() -> NodeId {
    Uuid::new_v4().simple().to_string()
}

/// Binding of one template to one usage node: the private id namespace
/// of a single subflow instance.
#[derive(Debug)]
pub struct SubflowBinding {
    template: Arc<SubflowTemplate>,
    usage: NodeConfig,
    id_map: HashMap<NodeId, NodeId>,
    input_id: NodeId,
    status_sink: Option<NodeId>,
    complete_sink: Option<NodeId>,
}

impl SubflowBinding {
    pub fn new(template: Arc<SubflowTemplate>, usage: NodeConfig) -> Self {
        let id_map = template
            .nodes
            .iter()
            .map(|n| (n.id.clone(), private_id()))
            .collect();
        let status_sink = template.status.as_ref().map(|_| private_id());
        let complete_sink = template.complete.as_ref().map(|_| private_id());
        Self {
            template,
            usage,
            id_map,
            input_id: private_id(),
            status_sink,
            complete_sink,
        }
    }

    pub fn template(&self) -> &SubflowTemplate {
        &self.template
    }

    pub fn usage(&self) -> &NodeConfig {
        &self.usage
    }

    pub fn input_id(&self) -> &str {
        &self.input_id
    }

    /// Private id of the template node `template_id`
    pub fn private_id(&self, template_id: &str) -> Option<&str> {
        self.id_map.get(template_id).map(String::as_str)
    }

    /// Template id a private id was allocated for
    pub fn alias_of(&self, private: &str) -> Option<&str> {
        self.id_map
            .iter()
            .find(|(_, p)| p.as_str() == private)
            .map(|(t, _)| t.as_str())
    }

    pub fn intercepts_status(&self) -> bool {
        self.template.status.is_some()
    }

    pub fn intercepts_complete(&self) -> bool {
        self.template.complete.is_some()
    }

    /// Template defaults overridden by the usage node's own definitions.
    pub fn env_entries(&self) -> Vec<EnvEntry> {
        let mut entries = self.template.env.clone();
        for entry in self.usage.env_entries() {
            match entries.iter_mut().find(|e| e.name == entry.name) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        entries
    }

    fn map_id(&self, id: &str) -> NodeId {
        self.id_map.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    fn remap_property(&self, key: &str, value: &Value) -> Value {
        if key == "env" {
            return value.clone();
        }
        self.remap_value(value)
    }

    /// Internal ids anywhere inside `value`, at any depth, move to the
    /// private namespace.
    fn remap_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => match self.id_map.get(s) {
                Some(private) => Value::String(private.clone()),
                None => value.clone(),
            },
            Value::Array(items) => Value::Array(items.iter().map(|v| self.remap_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.remap_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Private node graph for this instance, wired to `outer`, the usage
    /// node's own outbound wiring.
    ///
    /// Internal ids, wires, config references and receiver scopes are
    /// rewritten into the private namespace. Output ports forward straight
    /// to the outer targets; a template input wired directly to an output
    /// becomes part of the input node's wiring.
    pub fn expand(&self, outer: &[Vec<NodeId>]) -> Vec<NodeConfig> {
        let template = &self.template;
        let mut nodes: Vec<NodeConfig> = template
            .nodes
            .iter()
            .map(|n| {
                let mut node = n.clone();
                node.id = self.map_id(&n.id);
                node.parent_flow_id = Some(self.usage.id.clone());
                node.wires = n.wires.as_ref().map(|wires| {
                    wires
                        .iter()
                        .map(|port| port.iter().map(|id| self.map_id(id)).collect())
                        .collect()
                });
                node.properties = n
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), self.remap_property(k, v)))
                    .collect();
                node
            })
            .collect();

        let mut input_wires: Vec<NodeId> = template
            .inputs
            .first()
            .map(|port| port.wires.iter().map(|w| self.map_id(&w.id)).collect())
            .unwrap_or_default();

        for (index, port) in template.outputs.iter().enumerate() {
            let targets = outer.get(index).cloned().unwrap_or_default();
            for wire in &port.wires {
                if wire.id == template.id {
                    input_wires.extend(targets.iter().cloned());
                } else {
                    append_wires(&mut nodes, &self.map_id(&wire.id), wire.port, &targets);
                }
            }
        }

        let sinks = [
            (&template.status, &self.status_sink, STATUS_SINK_TYPE),
            (&template.complete, &self.complete_sink, COMPLETE_SINK_TYPE),
        ];
        for (port, sink, sink_type) in sinks {
            let (Some(port), Some(sink)) = (port, sink) else {
                continue;
            };
            for wire in &port.wires {
                append_wires(&mut nodes, &self.map_id(&wire.id), wire.port, &[sink.clone()]);
            }
            nodes.push(
                NodeConfig::new(sink.clone(), sink_type)
                    .in_flow(self.usage.id.clone())
                    .with_wires(Vec::new()),
            );
        }

        nodes.push(
            NodeConfig::new(self.input_id.clone(), INPUT_TYPE)
                .in_flow(self.usage.id.clone())
                .with_wires(vec![input_wires]),
        );
        nodes
    }
}

fn append_wires(nodes: &mut [NodeConfig], id: &str, port: usize, targets: &[NodeId]) {
    let Some(node) = nodes.iter_mut().find(|n| n.id == id) else {
        tracing::debug!("Subflow port references unknown node {}", id);
        return;
    };
    let wires: &mut Wires = node.wires.get_or_insert_with(Vec::new);
    if wires.len() <= port {
        wires.resize(port + 1, Vec::new());
    }
    wires[port].extend(targets.iter().cloned());
}

/// Stand-in for a usage node at the parent level: hands every message to
/// its instance's input node.
pub struct SubflowNode {
    node_type: String,
    instance: Arc<Flow>,
}

impl SubflowNode {
    pub fn new(node_type: &str, instance: Arc<Flow>) -> Self {
        Self {
            node_type: node_type.to_string(),
            instance,
        }
    }
}

impl Node for SubflowNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn on_input(&self, msg: Message, _ctx: &NodeContext) -> Result<(), NodeError> {
        self.instance.deliver_input(msg);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Status,
    Complete,
}

/// Terminal node behind a template's status or complete port.
pub struct PortSink {
    kind: PortKind,
    instance: Weak<Flow>,
}

impl PortSink {
    pub fn new(kind: PortKind, instance: Weak<Flow>) -> Self {
        Self { kind, instance }
    }
}

impl Node for PortSink {
    fn node_type(&self) -> &str {
        match self.kind {
            PortKind::Status => STATUS_SINK_TYPE,
            PortKind::Complete => COMPLETE_SINK_TYPE,
        }
    }

    fn on_input(&self, msg: Message, _ctx: &NodeContext) -> Result<(), NodeError> {
        if let Some(instance) = self.instance.upgrade() {
            instance.report_port(self.kind, &msg);
        }
        Ok(())
    }
}
