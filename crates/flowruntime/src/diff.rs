use crate::config::ParsedConfig;
use crate::dependency::collect_references;
use flowcore::{NodeConfig, NodeId, SubflowTemplate};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Delta between two deployed generations. Every list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowDiff {
    pub added: Vec<NodeId>,
    pub changed: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub rewired: Vec<NodeId>,
    /// Unmodified nodes wired to a modified one
    pub linked: Vec<NodeId>,
}

impl FlowDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.rewired.is_empty()
    }

    pub fn is_changed(&self, id: &str) -> bool {
        self.changed.iter().any(|c| c == id)
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.removed.iter().any(|r| r == id)
    }

    pub fn is_rewired(&self, id: &str) -> bool {
        self.rewired.iter().any(|r| r == id)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Tab,
    Subflow,
}

fn container(config: &ParsedConfig, id: &str) -> Option<Container> {
    if config.flows.iter().any(|f| f.id == id) {
        Some(Container::Tab)
    } else if config.subflows.contains_key(id) {
        Some(Container::Subflow)
    } else {
        None
    }
}

/// A material change ignores editor position and wiring.
fn node_differs(old: &NodeConfig, new: &NodeConfig) -> bool {
    if old.node_type != new.node_type
        || old.parent_flow_id != new.parent_flow_id
        || old.disabled != new.disabled
    {
        return true;
    }
    let material = |n: &NodeConfig| {
        n.properties
            .iter()
            .filter(|(k, _)| k.as_str() != "x" && k.as_str() != "y")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<HashMap<_, _>>()
    };
    material(old) != material(new)
}

fn template_differs(old: &SubflowTemplate, new: &SubflowTemplate) -> bool {
    old.name != new.name
        || old.inputs != new.inputs
        || old.outputs != new.outputs
        || old.status != new.status
        || old.complete != new.complete
        || old.env != new.env
}

struct DiffState<'a> {
    new: &'a ParsedConfig,
    added: BTreeSet<NodeId>,
    changed: BTreeSet<NodeId>,
    removed: BTreeSet<NodeId>,
    rewired: BTreeSet<NodeId>,
    changed_subflows: BTreeSet<NodeId>,
}

impl DiffState<'_> {
    /// Mark the container `z` changed. Returns true when it is a subflow
    /// template, in which case the node itself is folded into the
    /// template's change.
    fn touch_container(&mut self, z: Option<&str>) -> bool {
        let Some(z) = z else {
            return false;
        };
        match container(self.new, z) {
            Some(Container::Tab) => {
                self.changed.insert(z.to_string());
                false
            }
            Some(Container::Subflow) => {
                self.changed.insert(z.to_string());
                self.changed_subflows.insert(z.to_string());
                true
            }
            None => false,
        }
    }
}

fn record_links(links: &mut HashMap<NodeId, Vec<NodeId>>, node: &NodeConfig) {
    for target in node.wires().iter().flatten() {
        let from = links.entry(node.id.clone()).or_default();
        if !from.contains(target) {
            from.push(target.clone());
        }
        let to = links.entry(target.clone()).or_default();
        if !to.contains(&node.id) {
            to.push(node.id.clone());
        }
    }
}

/// Compute what a redeploy from `old` to `new` touches.
///
/// Nodes inside subflow templates never appear themselves: any change
/// inside a template marks the template changed, and with it every usage
/// node of that template, transitively through nested templates.
pub fn diff_configs(old: &ParsedConfig, new: &ParsedConfig) -> FlowDiff {
    let mut state = DiffState {
        new,
        added: BTreeSet::new(),
        changed: BTreeSet::new(),
        removed: BTreeSet::new(),
        rewired: BTreeSet::new(),
        changed_subflows: BTreeSet::new(),
    };
    let mut links: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    for tab in &old.flows {
        match new.flows.iter().find(|f| f.id == tab.id) {
            None => {
                state.removed.insert(tab.id.clone());
            }
            Some(next) => {
                if tab.label != next.label || tab.env != next.env || tab.disabled != next.disabled {
                    state.changed.insert(tab.id.clone());
                }
            }
        }
    }
    for tab in &new.flows {
        if old.flows.iter().all(|f| f.id != tab.id) {
            state.added.insert(tab.id.clone());
        }
    }
    for (id, template) in old.subflows.iter() {
        match new.subflows.get(id) {
            None => {
                state.removed.insert(id.clone());
            }
            Some(next) if template_differs(template, next) => {
                state.changed.insert(id.clone());
                state.changed_subflows.insert(id.clone());
            }
            Some(_) => {}
        }
    }
    for id in new.subflows.keys() {
        if !old.subflows.contains_key(id) {
            state.added.insert(id.clone());
        }
    }

    for (id, node) in &old.all_nodes {
        record_links(&mut links, node);
        match new.all_nodes.get(id) {
            None => {
                state.removed.insert(id.clone());
                state.touch_container(node.parent_flow_id.as_deref());
            }
            Some(next) => {
                if node_differs(node, next) {
                    state.changed.insert(id.clone());
                    if state.touch_container(next.parent_flow_id.as_deref()) {
                        state.changed.remove(id);
                    }
                }
                if node.wires != next.wires {
                    state.rewired.insert(id.clone());
                    if state.touch_container(next.parent_flow_id.as_deref()) {
                        state.rewired.remove(id);
                    }
                }
            }
        }
    }

    for (id, node) in &new.all_nodes {
        record_links(&mut links, node);
        if !old.all_nodes.contains_key(id) {
            state.added.insert(id.clone());
            if state.touch_container(node.parent_flow_id.as_deref()) {
                state.added.remove(id);
            }
        }
    }

    // Nodes referencing a changed or removed node are changed too
    loop {
        let mut marked = Vec::new();
        for (id, node) in &new.all_nodes {
            if state.changed.contains(id) {
                continue;
            }
            let mut refs = Vec::new();
            for value in node.properties.values() {
                collect_references(value, &mut refs);
            }
            if refs
                .iter()
                .any(|r| *r != id.as_str() && (state.changed.contains(*r) || state.removed.contains(*r)))
            {
                marked.push(node);
            }
        }
        if marked.is_empty() {
            break;
        }
        for node in marked {
            state.changed.insert(node.id.clone());
            if state.touch_container(node.parent_flow_id.as_deref()) {
                state.changed.remove(&node.id);
            }
        }
    }

    let mut stack: Vec<NodeId> = state.changed_subflows.iter().cloned().collect();
    let mut seen: HashSet<NodeId> = stack.iter().cloned().collect();
    while let Some(template_id) = stack.pop() {
        for node in new.all_nodes.values() {
            if node.subflow_template() != Some(template_id.as_str()) {
                continue;
            }
            state.changed.insert(node.id.clone());
            let z = node.parent_flow_id.as_deref();
            if state.touch_container(z) {
                state.changed.remove(&node.id);
                if let Some(z) = z {
                    if seen.insert(z.to_string()) {
                        stack.push(z.to_string());
                    }
                }
            }
        }
    }

    let modified: HashSet<&NodeId> = state
        .added
        .iter()
        .chain(&state.changed)
        .chain(&state.removed)
        .chain(&state.rewired)
        .collect();
    let mut linked = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut pending: Vec<NodeId> = modified.iter().map(|id| (*id).clone()).collect();
    while let Some(id) = pending.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        if let Some(neighbours) = links.get(&id) {
            if !modified.contains(&id) {
                linked.insert(id.clone());
            }
            pending.extend(neighbours.iter().cloned());
        }
    }

    FlowDiff {
        added: state.added.into_iter().collect(),
        changed: state.changed.into_iter().collect(),
        removed: state.removed.into_iter().collect(),
        rewired: state.rewired.into_iter().collect(),
        linked: linked.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use serde_json::{json, Value};

    fn base() -> Vec<Value> {
        vec![
            json!({"id": "t1", "type": "tab"}),
            json!({"id": "1", "type": "test", "z": "t1", "x": 1, "y": 1, "foo": "a", "wires": [["2"]]}),
            json!({"id": "2", "type": "test", "z": "t1", "x": 1, "y": 1, "foo": "a", "wires": [["3"]]}),
            json!({"id": "3", "type": "test", "z": "t1", "x": 1, "y": 1, "foo": "a", "wires": []}),
            json!({"id": "4", "type": "test", "z": "t1", "x": 1, "y": 1, "cfg": "c1", "wires": []}),
            json!({"id": "c1", "type": "cfg", "host": "a"}),
        ]
    }

    fn diff(old: &[Value], new: &[Value]) -> FlowDiff {
        diff_configs(&parse_config(old).unwrap(), &parse_config(new).unwrap())
    }

    fn set(records: &mut [Value], id: &str, key: &str, value: Value) {
        let record = records.iter_mut().find(|r| r["id"] == id).unwrap();
        record[key] = value;
    }

    #[test]
    fn identical_configs_have_empty_diff() {
        assert!(diff(&base(), &base()).is_empty());
    }

    #[test]
    fn position_only_change_is_ignored() {
        let mut next = base();
        set(&mut next, "1", "x", json!(99));
        assert!(diff(&base(), &next).is_empty());
    }

    #[test]
    fn property_change_marks_node_and_tab_changed() {
        let mut next = base();
        set(&mut next, "2", "foo", json!("b"));
        let d = diff(&base(), &next);
        assert_eq!(d.changed, vec!["2", "t1"]);
        assert!(d.rewired.is_empty());
        assert_eq!(d.linked, vec!["1", "3"]);
    }

    #[test]
    fn wiring_change_marks_node_rewired() {
        let mut next = base();
        set(&mut next, "1", "wires", json!([["3"]]));
        let d = diff(&base(), &next);
        assert_eq!(d.rewired, vec!["1"]);
        assert!(!d.is_changed("1"));
    }

    #[test]
    fn users_of_a_changed_config_node_are_changed() {
        let mut next = base();
        set(&mut next, "c1", "host", json!("b"));
        let d = diff(&base(), &next);
        assert!(d.is_changed("c1"));
        assert!(d.is_changed("4"));
        assert!(!d.is_changed("1"));
    }

    #[test]
    fn added_and_removed_nodes() {
        let mut next = base();
        next.retain(|r| r["id"] != "3");
        next.push(json!({"id": "5", "type": "test", "z": "t1", "x": 1, "y": 1, "wires": []}));
        let d = diff(&base(), &next);
        assert_eq!(d.added, vec!["5"]);
        assert_eq!(d.removed, vec!["3"]);
    }

    #[test]
    fn template_change_marks_usage_nodes_transitively() {
        let with_templates = |inner_foo: &str| {
            let mut records = base();
            records.extend([
                json!({"id": "sfA", "type": "subflow", "in": [], "out": []}),
                json!({"id": "a1", "type": "test", "z": "sfA", "x": 1, "y": 1, "foo": inner_foo, "wires": []}),
                json!({"id": "sfB", "type": "subflow", "in": [], "out": []}),
                json!({"id": "b1", "type": "subflow:sfA", "z": "sfB", "x": 1, "y": 1, "wires": []}),
                json!({"id": "u", "type": "subflow:sfB", "z": "t1", "x": 1, "y": 1, "wires": []}),
            ]);
            records
        };

        let d = diff(&with_templates("a"), &with_templates("b"));
        assert!(d.is_changed("u"));
        assert!(d.is_changed("sfA"));
        assert!(d.is_changed("sfB"));
        assert!(!d.is_changed("a1"));
        assert!(!d.is_changed("b1"));
    }
}
