// crates/flowruntime/tests/flow_test.rs

mod common;

use common::{init_tracing, payload, records, standalone_flow, Recorder};
use flowcore::{ConfigError, FlowError, Message, NodeError};
use flowruntime::{diff_configs, parse_config, FlowState, StandaloneParent};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn chain() -> Value {
    json!([
        {"id": "t1", "type": "tab", "label": "Main"},
        {"id": "A", "type": "test", "z": "t1", "x": 10, "y": 10, "broker": "D", "wires": [["B"]]},
        {"id": "B", "type": "test", "z": "t1", "x": 20, "y": 10, "wires": [["C"]]},
        {"id": "C", "type": "test", "z": "t1", "x": 30, "y": 10, "wires": []},
        {"id": "D", "type": "testConfig", "z": "t1"}
    ])
}

#[tokio::test]
async fn config_nodes_start_before_their_users() {
    init_tracing();
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);

    flow.start(None).await.unwrap();

    assert_eq!(flow.state(), FlowState::Started);
    assert_eq!(recorder.nodes_with("start"), vec!["D", "A", "B", "C"]);
    assert_eq!(flow.active_node_ids(), vec!["D", "A", "B", "C"]);
    assert!(flow.active_node("D").unwrap().is_config_node());
}

#[tokio::test]
async fn messages_follow_wires_depth_first() {
    init_tracing();
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    flow.inject("A", Message::with_payload(1)).unwrap();
    flow.inject("A", Message::with_payload(2)).unwrap();

    assert_eq!(recorder.input_order(), vec!["A", "B", "C", "A", "B", "C"]);
    let at_c: Vec<Value> = recorder.inputs("C").iter().map(payload).collect();
    assert_eq!(at_c, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn fan_out_delivers_copies_in_wire_order() {
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab"},
        {"id": "src", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": [["x", "y"], ["z"]]},
        {"id": "x", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": []},
        {"id": "y", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": []},
        {"id": "z", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": []}
    ]);
    let flow = standalone_flow(config, &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    flow.inject("src", Message::with_payload("hello")).unwrap();

    // Port 1 is never sent on by a forwarding node
    assert_eq!(recorder.input_order(), vec!["src", "x", "y"]);
    let x = &recorder.inputs("x")[0];
    let y = &recorder.inputs("y")[0];
    assert_eq!(x, y);
    assert_eq!(payload(x), json!("hello"));
}

#[tokio::test]
async fn stop_closes_ordinary_nodes_before_config_nodes() {
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    let report = flow.stop(None, None).await;

    assert_eq!(recorder.nodes_with("close"), vec!["A", "B", "C", "D"]);
    assert_eq!(report.closed.len(), 4);
    assert!(report.timed_out.is_empty());
    assert!(flow.active_node_ids().is_empty());
    assert_eq!(flow.state(), FlowState::Stopped);
}

#[tokio::test]
async fn cyclic_config_dependencies_leave_flow_empty() {
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab"},
        {"id": "X", "type": "testConfig", "z": "t1", "peer": "Y"},
        {"id": "Y", "type": "testConfig", "z": "t1", "peer": "X"},
        {"id": "A", "type": "test", "z": "t1", "x": 0, "y": 0, "broker": "X", "wires": []}
    ]);
    let flow = standalone_flow(config, &recorder, StandaloneParent::new(), 500);

    let err = flow.start(None).await.unwrap_err();

    assert!(matches!(
        err,
        FlowError::Config(ConfigError::CircularDependency { .. })
    ));
    assert!(flow.active_node_ids().is_empty());
    assert!(recorder.nodes_with("create").is_empty());
}

#[tokio::test]
async fn slow_close_is_abandoned_after_timeout() {
    init_tracing();
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab"},
        {"id": "slow", "type": "testAsync", "z": "t1", "x": 0, "y": 0, "closeDelay": 80, "wires": []},
        {"id": "quick", "type": "testAsync", "z": "t1", "x": 0, "y": 0, "closeDelay": 10, "wires": []}
    ]);
    let flow = standalone_flow(config, &recorder, StandaloneParent::new(), 50);
    flow.start(None).await.unwrap();

    let started = Instant::now();
    let report = flow.stop(None, None).await;
    let elapsed = started.elapsed();

    assert_eq!(report.timed_out, vec!["slow".to_string()]);
    assert_eq!(report.closed, vec!["quick".to_string()]);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(80));
    assert!(flow.active_node_ids().is_empty());
}

#[tokio::test]
async fn failed_construction_is_isolated() {
    init_tracing();
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab"},
        {"id": "A", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": [["F", "C"]]},
        {"id": "F", "type": "testFail", "z": "t1", "x": 0, "y": 0, "wires": [["C"]]},
        {"id": "P", "type": "testPanic", "z": "t1", "x": 0, "y": 0, "wires": []},
        {"id": "U", "type": "nosuchtype", "z": "t1", "x": 0, "y": 0, "wires": []},
        {"id": "C", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": []}
    ]);
    let flow = standalone_flow(config, &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    assert_eq!(flow.active_node_ids(), vec!["A", "C"]);
    let failures = flow.construction_failures();
    assert!(matches!(failures["F"], NodeError::Construction(_)));
    assert!(matches!(failures["P"], NodeError::Construction(_)));
    assert!(matches!(failures["U"], NodeError::UnknownType(_)));

    flow.inject("A", Message::with_payload(1)).unwrap();
    assert_eq!(recorder.input_order(), vec!["A", "C"]);
}

#[tokio::test]
async fn disabled_nodes_are_not_created() {
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab"},
        {"id": "A", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": [["B"]]},
        {"id": "B", "type": "test", "z": "t1", "x": 0, "y": 0, "d": true, "wires": []}
    ]);
    let flow = standalone_flow(config, &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    assert_eq!(flow.active_node_ids(), vec!["A"]);
    flow.inject("A", Message::with_payload(1)).unwrap();
    assert_eq!(recorder.input_order(), vec!["A"]);
    assert!(flow.inject("B", Message::new()).is_err());
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();

    let err = flow.start(None).await.unwrap_err();
    assert!(matches!(err, FlowError::Lifecycle(_)));
    assert_eq!(recorder.nodes_with("create").len(), 4);
}

#[tokio::test]
async fn rewiring_keeps_the_instance() {
    init_tracing();
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();
    let before = flow.active_node("B").unwrap();
    let created = recorder.nodes_with("create");

    let old = parse_config(&records(chain())).unwrap();
    let next_records = json!([
        {"id": "t1", "type": "tab", "label": "Main"},
        {"id": "A", "type": "test", "z": "t1", "x": 10, "y": 10, "broker": "D", "wires": [["B"]]},
        {"id": "B", "type": "test", "z": "t1", "x": 20, "y": 10, "wires": [["E"]]},
        {"id": "C", "type": "test", "z": "t1", "x": 30, "y": 10, "wires": []},
        {"id": "E", "type": "test", "z": "t1", "x": 40, "y": 10, "wires": []},
        {"id": "D", "type": "testConfig", "z": "t1"}
    ]);
    let next = parse_config(&records(next_records)).unwrap();
    let diff = diff_configs(&old, &next);
    assert_eq!(diff.rewired, vec!["B".to_string()]);
    assert_eq!(diff.added, vec!["E".to_string()]);
    assert!(!diff.is_changed("A"));
    assert!(!diff.is_changed("B"));

    flow.update(next.flow("t1").unwrap().clone());
    flow.start(Some(&diff)).await.unwrap();

    let after = flow.active_node("B").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.wires(), vec![vec!["E".to_string()]]);
    assert!(recorder.nodes_with("close").is_empty());

    // B is rewired exactly once, only E is constructed
    assert_eq!(recorder.rewires("B"), vec![vec![vec!["E".to_string()]]]);
    assert_eq!(recorder.nodes_with("rewire"), vec!["B"]);
    let mut expected = created;
    expected.push("E".to_string());
    assert_eq!(recorder.nodes_with("create"), expected);

    recorder.clear();
    flow.inject("A", Message::with_payload(1)).unwrap();
    assert_eq!(recorder.input_order(), vec!["A", "B", "E"]);
}

#[tokio::test]
async fn changed_and_removed_nodes_are_replaced() {
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();
    let before = flow.active_node("B").unwrap();

    let old = parse_config(&records(chain())).unwrap();
    let next_records = json!([
        {"id": "t1", "type": "tab", "label": "Main"},
        {"id": "A", "type": "test", "z": "t1", "x": 10, "y": 10, "broker": "D", "wires": [["B"]]},
        {"id": "B", "type": "test", "z": "t1", "x": 20, "y": 10, "name": "renamed", "wires": []},
        {"id": "D", "type": "testConfig", "z": "t1"}
    ]);
    let next = parse_config(&records(next_records)).unwrap();
    let diff = diff_configs(&old, &next);
    assert!(diff.is_changed("B"));
    assert!(diff.is_removed("C"));

    flow.update(next.flow("t1").unwrap().clone());
    flow.start(Some(&diff)).await.unwrap();

    let after = flow.active_node("B").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.config().name(), Some("renamed"));
    assert_eq!(recorder.nodes_with("close"), vec!["B"]);
    assert_eq!(recorder.nodes_with("removed"), vec!["C"]);
    assert_eq!(flow.active_node_ids(), vec!["D", "A", "B"]);
}

#[tokio::test]
async fn env_values_resolve_through_the_scope_chain() {
    let recorder = Recorder::new();
    let config = json!([
        {"id": "t1", "type": "tab", "label": "Main", "env": [
            {"name": "GREETING", "value": "hi", "type": "str"},
            {"name": "LIMIT", "value": "5", "type": "num"},
            {"name": "FROM_ROOT", "value": "ROOT_ONLY", "type": "env"}
        ]},
        {"id": "E", "type": "testEnv", "z": "t1", "x": 0, "y": 0,
         "value": "$(GREETING)", "lookup": "LIMIT", "wires": [["out"]]},
        {"id": "N", "type": "testEnv", "z": "t1", "x": 0, "y": 0,
         "value": "$(FLOW_NAME)", "lookup": "FROM_ROOT", "wires": [["out"]]},
        {"id": "out", "type": "test", "z": "t1", "x": 0, "y": 0, "wires": []}
    ]);
    let parent = StandaloneParent::new().with_setting("ROOT_ONLY", "from the root");
    let flow = standalone_flow(config, &recorder, parent, 500);
    flow.start(None).await.unwrap();

    assert_eq!(flow.get_setting("FLOW_ID"), Some(json!("t1")));
    assert_eq!(flow.get_setting("GREETING"), Some(json!("hi")));
    assert_eq!(flow.get_setting("$parent.GREETING"), None);

    flow.inject("E", Message::new()).unwrap();
    flow.inject("N", Message::new()).unwrap();

    let out = recorder.inputs("out");
    assert_eq!(out[0].get("value"), Some(&json!("hi")));
    assert_eq!(out[0].get("setting"), Some(&json!(5)));
    assert_eq!(out[1].get("value"), Some(&json!("Main")));
    assert_eq!(out[1].get("setting"), Some(&json!("from the root")));
}

#[tokio::test]
async fn stopped_nodes_drop_late_messages() {
    let recorder = Recorder::new();
    let flow = standalone_flow(chain(), &recorder, StandaloneParent::new(), 500);
    flow.start(None).await.unwrap();
    let handle = flow.active_node("B").unwrap();

    flow.stop(Some(vec!["B".to_string()]), None).await;
    assert!(handle.is_cancelled());
    assert_eq!(flow.state(), FlowState::Started);

    handle.receive(Message::with_payload(1));
    flow.inject("A", Message::with_payload(2)).unwrap();
    assert_eq!(recorder.input_order(), vec!["A"]);
}
