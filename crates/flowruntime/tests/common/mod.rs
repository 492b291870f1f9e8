// crates/flowruntime/tests/common/mod.rs

#![allow(dead_code)]

use flowcore::{CloseSignal, Message, Node, NodeConfig, NodeContext, NodeError, NodeStatus, Wires};
use flowruntime::{
    parse_config, EngineContext, Flow, FlowRuntime, NodeFactory, NodeRegistry, RuntimeConfig,
    StandaloneParent,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct Record {
    pub node: String,
    pub event: &'static str,
    pub msg: Option<Message>,
    pub wires: Option<Wires>,
}

/// Shared log of everything the test nodes saw.
#[derive(Debug, Default)]
pub struct Recorder {
    records: Mutex<Vec<Record>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, node: &str, event: &'static str, msg: Option<Message>) {
        self.records.lock().push(Record {
            node: node.to_string(),
            event,
            msg,
            wires: None,
        });
    }

    fn push_rewire(&self, node: &str, wires: &Wires) {
        self.records.lock().push(Record {
            node: node.to_string(),
            event: "rewire",
            msg: None,
            wires: Some(wires.clone()),
        });
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Nodes that logged `event`, in order.
    pub fn nodes_with(&self, event: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event == event)
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn inputs(&self, node: &str) -> Vec<Message> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.node == node && r.event == "input")
            .filter_map(|r| r.msg.clone())
            .collect()
    }

    /// Every wiring handed to `node` by an in-place rewire
    pub fn rewires(&self, node: &str) -> Vec<Wires> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.node == node && r.event == "rewire")
            .filter_map(|r| r.wires.clone())
            .collect()
    }

    /// Ids of the nodes that received input, in delivery order
    pub fn input_order(&self) -> Vec<String> {
        self.nodes_with("input")
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Forward,
    Error,
    Status,
    Env,
}

/// Node used by the integration tests. Logs every hook to the recorder.
///
/// * `test` forwards its input on port 0
/// * `testAsync` closes `closeDelay` ms after being asked to
/// * `testError` fails every input
/// * `testStatus` reports its payload as status text, then forwards
/// * `testEnv` forwards with its resolved `value` and the setting named by
///   `lookup` attached
pub struct TestNode {
    node_type: String,
    id: String,
    behavior: Behavior,
    close_delay: Option<Duration>,
    value: Option<Value>,
    lookup: Option<String>,
    recorder: Arc<Recorder>,
}

impl Node for TestNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn on_start(&self, _ctx: &NodeContext) {
        self.recorder.push(&self.id, "start", None);
    }

    fn on_input(&self, msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        self.recorder.push(&self.id, "input", Some(msg.clone()));
        match self.behavior {
            Behavior::Forward => ctx.send(msg),
            Behavior::Error => return Err(NodeError::ExecutionFailed("boom".into())),
            Behavior::Status => {
                let text = match msg.payload() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                ctx.status(NodeStatus::text(text));
                ctx.send(msg);
            }
            Behavior::Env => {
                let mut out = msg;
                out.insert("value", self.value.clone().unwrap_or(Value::Null));
                let setting = self.lookup.as_deref().and_then(|name| ctx.env(name));
                out.insert("setting", setting.unwrap_or(Value::Null));
                ctx.send(out);
            }
        }
        Ok(())
    }

    fn on_rewire(&self, wires: &Wires) {
        self.recorder.push_rewire(&self.id, wires);
    }

    fn on_close(&self, removed: bool, done: CloseSignal) {
        self.recorder
            .push(&self.id, if removed { "removed" } else { "close" }, None);
        match self.close_delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    done.closed();
                });
            }
            None => done.closed(),
        }
    }
}

pub struct TestFactory {
    node_type: &'static str,
    recorder: Arc<Recorder>,
}

impl NodeFactory for TestFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let behavior = match self.node_type {
            "testFail" => return Err(NodeError::Construction("refused".into())),
            "testPanic" => panic!("factory exploded"),
            "testError" => Behavior::Error,
            "testStatus" => Behavior::Status,
            "testEnv" => Behavior::Env,
            _ => Behavior::Forward,
        };
        let close_delay = (self.node_type == "testAsync").then(|| {
            let ms = config.property("closeDelay").and_then(Value::as_u64).unwrap_or(0);
            Duration::from_millis(ms)
        });
        self.recorder.push(&config.id, "create", None);
        Ok(Box::new(TestNode {
            node_type: self.node_type.to_string(),
            id: config.id.clone(),
            behavior,
            close_delay,
            value: config.property("value").cloned(),
            lookup: config
                .property("lookup")
                .and_then(Value::as_str)
                .map(str::to_string),
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn node_type(&self) -> &str {
        self.node_type
    }
}

pub const TEST_TYPES: &[&str] = &[
    "test",
    "testConfig",
    "testAsync",
    "testError",
    "testStatus",
    "testEnv",
    "testFail",
    "testPanic",
];

pub fn registry(recorder: &Arc<Recorder>) -> Arc<NodeRegistry> {
    let mut registry = NodeRegistry::new();
    for node_type in TEST_TYPES {
        registry.register(Arc::new(TestFactory {
            node_type,
            recorder: Arc::clone(recorder),
        }));
    }
    Arc::new(registry)
}

pub fn runtime_config(close_timeout_ms: u64) -> RuntimeConfig {
    RuntimeConfig {
        node_close_timeout: close_timeout_ms,
        ..RuntimeConfig::default()
    }
}

pub fn runtime(recorder: &Arc<Recorder>) -> FlowRuntime {
    FlowRuntime::new(registry(recorder), runtime_config(500))
}

pub fn records(value: Value) -> Vec<Value> {
    match value {
        Value::Array(records) => records,
        other => vec![other],
    }
}

/// The first tab of `config`, as a flow reporting to a standalone parent.
pub fn standalone_flow(
    config: Value,
    recorder: &Arc<Recorder>,
    parent: StandaloneParent,
    close_timeout_ms: u64,
) -> Arc<Flow> {
    let parsed = parse_config(&records(config)).expect("config parses");
    let tab = parsed.flows.into_iter().next().expect("config has a tab");
    let engine = EngineContext::new(registry(recorder), &runtime_config(close_timeout_ms));
    Flow::new(tab, Arc::new(parent), engine)
}

pub fn payload(msg: &Message) -> Value {
    msg.payload().cloned().unwrap_or(Value::Null)
}
