use flowcore::{ConfigError, FlowConfig, NodeConfig, SubflowTemplates};
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Collect every string found anywhere inside `value`.
pub fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Build the dependency graph of one flow's enabled nodes. An edge
/// `a -> b` means `a` references config node `b` from one of its
/// properties, so `b` must be created first.
fn build_graph(nodes: &[NodeConfig]) -> (DiGraph<usize, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut by_id: HashMap<&str, NodeIndex> = HashMap::new();
    let mut indices = Vec::new();

    for (pos, node) in nodes.iter().enumerate() {
        if node.disabled {
            continue;
        }
        let idx = graph.add_node(pos);
        by_id.insert(node.id.as_str(), idx);
        indices.push(idx);
    }

    for &idx in &indices {
        let node = &nodes[graph[idx]];
        let mut refs = Vec::new();
        for value in node.properties.values() {
            collect_references(value, &mut refs);
        }
        let mut linked = HashSet::new();
        for r in refs {
            if r == node.id {
                continue;
            }
            if let Some(&dep) = by_id.get(r) {
                if nodes[graph[dep]].is_config_node() && linked.insert(dep) {
                    graph.add_edge(idx, dep, ());
                }
            }
        }
    }

    (graph, indices)
}

/// Compute the creation order of a flow's enabled nodes.
///
/// Returns positions into `nodes`. Config nodes are visited first as DFS
/// roots, then the remaining nodes in declaration order; every node comes
/// after all config nodes it references. A reference back into the
/// current DFS stack fails with the id of the revisited node before
/// anything is created.
pub fn resolve_start_order(nodes: &[NodeConfig]) -> Result<Vec<usize>, ConfigError> {
    let (graph, indices) = build_graph(nodes);

    let roots = indices
        .iter()
        .filter(|&&i| nodes[graph[i]].is_config_node())
        .chain(indices.iter().filter(|&&i| !nodes[graph[i]].is_config_node()));

    let mut done: HashSet<NodeIndex> = HashSet::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    let mut order = Vec::with_capacity(indices.len());

    for &root in roots {
        visit(&graph, nodes, root, &mut done, &mut on_stack, &mut order)?;
    }

    Ok(order)
}

fn visit(
    graph: &DiGraph<usize, ()>,
    nodes: &[NodeConfig],
    idx: NodeIndex,
    done: &mut HashSet<NodeIndex>,
    on_stack: &mut HashSet<NodeIndex>,
    order: &mut Vec<usize>,
) -> Result<(), ConfigError> {
    if done.contains(&idx) {
        return Ok(());
    }
    if !on_stack.insert(idx) {
        return Err(ConfigError::CircularDependency {
            id: nodes[graph[idx]].id.clone(),
        });
    }

    // Neighbors come back in reverse insertion order
    let mut deps: Vec<NodeIndex> = graph.neighbors(idx).collect();
    deps.sort_by_key(|d| graph[*d]);
    for dep in deps {
        visit(graph, nodes, dep, done, on_stack, order)?;
    }

    on_stack.remove(&idx);
    done.insert(idx);
    order.push(graph[idx]);
    Ok(())
}

/// Check the subflow templates reachable from `nodes`: their internal
/// dependency graphs must be acyclic and templates must not contain
/// themselves. Missing templates are left to construction.
pub fn check_templates(
    nodes: &[NodeConfig],
    templates: &SubflowTemplates,
) -> Result<(), ConfigError> {
    let mut checked = HashSet::new();
    let mut path = Vec::new();
    check_usages(nodes, templates, &mut checked, &mut path)
}

fn check_usages(
    nodes: &[NodeConfig],
    templates: &SubflowTemplates,
    checked: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Result<(), ConfigError> {
    for node in nodes.iter().filter(|n| !n.disabled) {
        let Some(template_id) = node.subflow_template() else {
            continue;
        };
        if path.iter().any(|p| p == template_id) {
            return Err(ConfigError::CircularDependency {
                id: template_id.to_string(),
            });
        }
        if checked.contains(template_id) {
            continue;
        }
        let Some(template) = templates.get(template_id) else {
            continue;
        };

        resolve_start_order(&template.nodes)?;
        path.push(template_id.to_string());
        check_usages(&template.nodes, templates, checked, path)?;
        path.pop();
        checked.insert(template_id.to_string());
    }
    Ok(())
}

/// Validate a flow without side effects and return its creation order.
pub fn validate_flow(flow: &FlowConfig) -> Result<Vec<usize>, ConfigError> {
    let order = resolve_start_order(&flow.nodes)?;
    check_templates(&flow.nodes, &flow.subflows)?;
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::SubflowTemplate;
    use std::sync::Arc;

    fn wired(id: &str) -> NodeConfig {
        NodeConfig::new(id, "test").with_wires(vec![])
    }

    fn config(id: &str) -> NodeConfig {
        NodeConfig::new(id, "test")
    }

    fn ids(nodes: &[NodeConfig], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| nodes[i].id.clone()).collect()
    }

    #[test]
    fn config_nodes_come_before_their_users() {
        let nodes = vec![
            wired("1").with_property("foo", "a"),
            wired("2").with_property("foo", "d"),
            wired("3"),
            config("d").with_property("foo", "d"),
        ];
        let order = resolve_start_order(&nodes).unwrap();
        assert_eq!(ids(&nodes, &order), vec!["d", "1", "2", "3"]);
    }

    #[test]
    fn nested_references_are_followed() {
        let nodes = vec![
            config("c1").with_property("server", serde_json::json!({"ref": ["c2"]})),
            config("c2"),
        ];
        let order = resolve_start_order(&nodes).unwrap();
        assert_eq!(ids(&nodes, &order), vec!["c2", "c1"]);
    }

    #[test]
    fn wired_nodes_are_never_dependencies() {
        let nodes = vec![
            wired("out").with_property("links", serde_json::json!(["in"])),
            wired("in").with_property("links", serde_json::json!(["out"])),
        ];
        assert_eq!(ids(&nodes, &resolve_start_order(&nodes).unwrap()), vec!["out", "in"]);
    }

    #[test]
    fn cycle_names_the_revisited_node() {
        let nodes = vec![
            wired("1").with_property("cfg", "a"),
            config("a").with_property("next", "b"),
            config("b").with_property("next", "a"),
        ];
        assert_eq!(
            resolve_start_order(&nodes).unwrap_err(),
            ConfigError::CircularDependency { id: "a".into() }
        );
    }

    #[test]
    fn disabled_nodes_are_left_out() {
        let nodes = vec![wired("1"), wired("2").disabled(), config("c").disabled()];
        assert_eq!(ids(&nodes, &resolve_start_order(&nodes).unwrap()), vec!["1"]);
    }

    #[test]
    fn self_containing_template_is_rejected() {
        let template = SubflowTemplate {
            id: "sf".into(),
            name: None,
            inputs: vec![],
            outputs: vec![],
            status: None,
            complete: None,
            env: vec![],
            nodes: vec![NodeConfig::new("inner", "subflow:sf").with_wires(vec![])],
        };
        let mut templates = SubflowTemplates::new();
        templates.insert("sf".into(), Arc::new(template));

        let usage = vec![NodeConfig::new("u", "subflow:sf").with_wires(vec![])];
        assert_eq!(
            check_templates(&usage, &templates).unwrap_err(),
            ConfigError::CircularDependency { id: "sf".into() }
        );

        let missing = vec![NodeConfig::new("u", "subflow:none").with_wires(vec![])];
        assert!(check_templates(&missing, &templates).is_ok());
    }
}
