use crate::dependency;
use crate::diff::FlowDiff;
use crate::env;
use crate::events::{self, Origin, Receivers, RelayNode, ERROR_LOOP_LIMIT};
use crate::handle::{CloseOutcome, NodeHandle};
use crate::registry::NodeRegistry;
use crate::runtime::RuntimeConfig;
use crate::subflow::{self, PortKind, PortSink, SubflowBinding, SubflowNode};
use chrono::Utc;
use flowcore::{
    ConfigError, EventBus, FlowConfig, FlowError, Message, Node, NodeConfig, NodeError, NodeId,
    NodeStatus, RuntimeEvent, SubflowTemplate, Wires,
};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// What a flow reports to once a signal leaves its outermost level.
pub trait FlowParent: Send + Sync {
    /// Settings consulted after every flow-level scope.
    fn get_setting(&self, name: &str) -> Option<Value>;

    fn handle_error(&self, origin: &Origin, text: &str, msg: Option<&Message>) -> bool;

    fn handle_status(&self, origin: &Origin, status: &NodeStatus) -> bool;

    fn handle_complete(&self, _origin: &Origin, _msg: &Message) -> bool {
        false
    }

    /// Cross-flow lookup for ids not active in the asking flow.
    fn get_node(&self, id: &str) -> Option<Arc<NodeHandle>>;
}

/// Parent for a flow run on its own: settings come from a fixed map and
/// then the process environment; unhandled signals are logged.
#[derive(Debug, Default)]
pub struct StandaloneParent {
    settings: HashMap<String, Value>,
}

impl StandaloneParent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(name.into(), value.into());
        self
    }
}

impl FlowParent for StandaloneParent {
    fn get_setting(&self, name: &str) -> Option<Value> {
        self.settings
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok().map(Value::String))
    }

    fn handle_error(&self, origin: &Origin, text: &str, _msg: Option<&Message>) -> bool {
        tracing::warn!("[{}:{}] {}", origin.node_type, origin.id, text);
        false
    }

    fn handle_status(&self, _origin: &Origin, _status: &NodeStatus) -> bool {
        false
    }

    fn get_node(&self, _id: &str) -> Option<Arc<NodeHandle>> {
        None
    }
}

/// Services shared by every flow of one runtime.
pub struct EngineContext {
    pub registry: Arc<NodeRegistry>,
    pub close_timeout: Duration,
    pub bus: EventBus,
    next_index: AtomicU64,
}

impl EngineContext {
    pub fn new(registry: Arc<NodeRegistry>, config: &RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            close_timeout: config.close_timeout(),
            bus: EventBus::new(config.event_buffer_size),
            next_index: AtomicU64::new(0),
        })
    }

    /// Creation indices are unique and increasing across all flows.
    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Created,
    Started,
    Stopping,
    Stopped,
}

pub enum FlowKind {
    Tab,
    Global,
    Subflow(SubflowBinding),
}

enum ParentLink {
    Root(Arc<dyn FlowParent>),
    Flow(Weak<Flow>),
}

enum Level {
    Flow(Arc<Flow>),
    Root(Arc<dyn FlowParent>),
}

/// Outcome of a `stop()`, including nodes inside stopped subflow instances.
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub closed: Vec<NodeId>,
    pub timed_out: Vec<NodeId>,
    pub failed: Vec<(NodeId, NodeError)>,
}

impl StopReport {
    pub fn merge(&mut self, other: StopReport) {
        self.closed.extend(other.closed);
        self.timed_out.extend(other.timed_out);
        self.failed.extend(other.failed);
    }

    /// Every id that is no longer active, however its close resolved.
    pub fn stopped(&self) -> Vec<&str> {
        self.closed
            .iter()
            .chain(&self.timed_out)
            .chain(self.failed.iter().map(|(id, _)| id))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Clone)]
enum Removal {
    None,
    All,
    Ids(Arc<HashSet<NodeId>>),
}

impl Removal {
    fn contains(&self, id: &str) -> bool {
        match self {
            Removal::None => false,
            Removal::All => true,
            Removal::Ids(ids) => ids.contains(id),
        }
    }
}

/// One flow level: a tab, the global scope or a subflow instance.
pub struct Flow {
    id: String,
    kind: FlowKind,
    parent: ParentLink,
    engine: Arc<EngineContext>,
    config: RwLock<Arc<FlowConfig>>,
    state: RwLock<FlowState>,
    active: RwLock<HashMap<NodeId, Arc<NodeHandle>>>,
    instances: RwLock<HashMap<NodeId, Arc<Flow>>>,
    failures: RwLock<HashMap<NodeId, NodeError>>,
    receivers: RwLock<Receivers>,
    env: RwLock<HashMap<String, Value>>,
    me: Weak<Flow>,
}

impl Flow {
    /// A tab flow reporting to `parent`.
    pub fn new(
        config: FlowConfig,
        parent: Arc<dyn FlowParent>,
        engine: Arc<EngineContext>,
    ) -> Arc<Self> {
        Self::build(FlowKind::Tab, config, ParentLink::Root(parent), engine)
    }

    /// The global config scope.
    pub fn new_global(
        config: FlowConfig,
        parent: Arc<dyn FlowParent>,
        engine: Arc<EngineContext>,
    ) -> Arc<Self> {
        Self::build(FlowKind::Global, config, ParentLink::Root(parent), engine)
    }

    fn build(
        kind: FlowKind,
        config: FlowConfig,
        parent: ParentLink,
        engine: Arc<EngineContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: config.id.clone(),
            kind,
            parent,
            engine,
            config: RwLock::new(Arc::new(config)),
            state: RwLock::new(FlowState::Created),
            active: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            receivers: RwLock::new(Receivers::default()),
            env: RwLock::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Private expansion of `template` for the usage node `usage`.
    fn new_subflow(self: &Arc<Self>, usage: NodeConfig, template: Arc<SubflowTemplate>) -> Arc<Flow> {
        let mut config = FlowConfig::new(usage.id.clone());
        config.subflows = Arc::clone(&self.config().subflows);
        let binding = SubflowBinding::new(template, usage);
        config.nodes = binding.expand(binding.usage().wires());
        config.env = binding.env_entries();
        Self::build(
            FlowKind::Subflow(binding),
            config,
            ParentLink::Flow(Arc::downgrade(self)),
            Arc::clone(&self.engine),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &FlowKind {
        &self.kind
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    fn set_state(&self, state: FlowState) {
        *self.state.write() = state;
    }

    pub fn config(&self) -> Arc<FlowConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap in a new configuration generation. Takes effect for nodes
    /// created or rewired by the next `start`.
    pub fn update(&self, config: FlowConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Start the flow, or with `diff` apply a redeploy to a running flow.
    ///
    /// The whole configuration is validated first: a cyclic config-node
    /// graph fails here with nothing created. With a diff, changed and
    /// removed nodes are stopped, rewired nodes get their new wiring in
    /// place, and every node not yet active is created.
    pub async fn start(&self, diff: Option<&FlowDiff>) -> Result<(), FlowError> {
        let config = self.config();
        dependency::validate_flow(&config)?;

        match (self.state(), diff) {
            (FlowState::Stopping, _) => {
                return Err(FlowError::Lifecycle(format!("Flow {} is stopping", self.id)));
            }
            (FlowState::Started, None) => {
                return Err(FlowError::Lifecycle(format!("Flow {} is already started", self.id)));
            }
            _ => {}
        }

        match diff {
            Some(diff) => {
                let stale: Vec<NodeId> = {
                    let active = self.active.read();
                    diff.changed
                        .iter()
                        .chain(&diff.removed)
                        .filter(|id| active.contains_key(*id))
                        .cloned()
                        .collect()
                };
                if !stale.is_empty() {
                    self.stop(Some(stale), Some(diff.removed.clone())).await;
                }
                self.rewire(&config, diff);
            }
            None => self.failures.write().clear(),
        }

        self.set_state(FlowState::Started);
        self.activate()?;

        let active_nodes = self.active.read().len();
        tracing::info!("Started flow {} ({} active nodes)", self.id, active_nodes);
        self.engine.bus.emit(RuntimeEvent::FlowStarted {
            flow_id: self.id.clone(),
            active_nodes,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn rewire(&self, config: &FlowConfig, diff: &FlowDiff) {
        for id in &diff.rewired {
            if diff.is_changed(id) || diff.is_removed(id) {
                continue;
            }
            let (Some(node), Some(handle)) = (config.node(id), self.active_node(id)) else {
                continue;
            };
            let wires: Wires = node.wires.clone().unwrap_or_default();
            let instance = self.instances.read().get(id).cloned();
            if let Some(instance) = instance {
                instance.rewire_outputs(&wires);
            }
            tracing::debug!("Rewiring node {}", id);
            handle.update_wires(&wires);
        }
    }

    /// Create every enabled node that is not active yet, in dependency
    /// order.
    fn activate(&self) -> Result<(), ConfigError> {
        let config = self.config();
        let order = dependency::resolve_start_order(&config.nodes)?;

        let values = env::evaluate_env(&config.env, |name| self.parent_setting(name));
        *self.env.write() = values;

        for node in config.nodes.iter().filter(|n| n.disabled) {
            tracing::debug!("Skipping disabled node {}", node.id);
        }
        for pos in order {
            let node = &config.nodes[pos];
            if self.active.read().contains_key(&node.id) {
                continue;
            }
            self.instantiate(node, &config);
        }

        self.refresh_receivers();
        if tracing::enabled!(tracing::Level::TRACE) {
            for handle in self.active_nodes() {
                tracing::trace!(
                    "[{}] {} ({}) #{}",
                    self.id,
                    handle.id(),
                    handle.node_type(),
                    handle.creation_index()
                );
            }
        }
        Ok(())
    }

    fn instantiate(&self, node: &NodeConfig, config: &FlowConfig) {
        let resolved = env::resolve_node(node, &|name: &str| self.get_setting(name));
        match self.create_instance(&resolved, config) {
            Ok((instance, emits_complete)) => {
                let handle = NodeHandle::new(
                    resolved,
                    instance,
                    self.engine.next_index(),
                    self.me.clone(),
                    emits_complete,
                );
                self.failures.write().remove(&node.id);
                self.active.write().insert(node.id.clone(), Arc::clone(&handle));
                handle.start();
            }
            Err(e) => {
                tracing::error!("[{}:{}] failed to create node: {}", node.node_type, node.id, e);
                self.engine.bus.emit(RuntimeEvent::NodeFailed {
                    flow_id: self.id.clone(),
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                self.failures.write().insert(node.id.clone(), e);
            }
        }
    }

    /// Build the instance behind `config`; the flag tells whether handled
    /// inputs raise `complete`.
    fn create_instance(
        &self,
        config: &NodeConfig,
        flow_config: &FlowConfig,
    ) -> Result<(Box<dyn Node>, bool), NodeError> {
        if let Some(template_id) = config.subflow_template() {
            let template = flow_config.subflows.get(template_id).cloned().ok_or_else(|| {
                NodeError::Construction(format!("Unknown subflow template: {}", template_id))
            })?;
            let me = self
                .me
                .upgrade()
                .ok_or_else(|| NodeError::Construction("flow is gone".into()))?;

            let instance = me.new_subflow(config.clone(), template);
            instance.set_state(FlowState::Started);
            instance
                .activate()
                .map_err(|e| NodeError::Construction(e.to_string()))?;
            self.instances
                .write()
                .insert(config.id.clone(), Arc::clone(&instance));
            return Ok((Box::new(SubflowNode::new(&config.node_type, instance)), false));
        }

        let builtin: Option<Box<dyn Node>> = match config.node_type.as_str() {
            t if events::is_receiver_type(t) => Some(Box::new(RelayNode::new(t))),
            subflow::INPUT_TYPE => Some(Box::new(RelayNode::new(subflow::INPUT_TYPE))),
            subflow::STATUS_SINK_TYPE => {
                Some(Box::new(PortSink::new(PortKind::Status, self.me.clone())))
            }
            subflow::COMPLETE_SINK_TYPE => {
                Some(Box::new(PortSink::new(PortKind::Complete, self.me.clone())))
            }
            _ => None,
        };
        match builtin {
            Some(node) => Ok((node, false)),
            None => self.engine.registry.create_node(config).map(|n| (n, true)),
        }
    }

    fn refresh_receivers(&self) {
        let mut handles: Vec<Arc<NodeHandle>> = self
            .active
            .read()
            .values()
            .filter(|h| events::is_receiver_type(h.node_type()))
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.creation_index());
        *self.receivers.write() = Receivers::from_configs(handles.iter().map(|h| h.config()));
    }

    /// Stop the nodes in `filter` (every active node when `None`).
    ///
    /// Each target is cancelled and taken out of the active set right
    /// away, then closed. Closes are issued together, ordinary nodes before
    /// config nodes, and each is bounded by the close timeout. Ids listed
    /// in `removed` are told they are being deleted.
    pub fn stop(
        &self,
        filter: Option<Vec<NodeId>>,
        removed: Option<Vec<NodeId>>,
    ) -> BoxFuture<'static, StopReport> {
        let removal = match removed {
            Some(ids) => Removal::Ids(Arc::new(ids.into_iter().collect())),
            None => Removal::None,
        };
        self.stop_with(filter, removal)
    }

    fn stop_with(&self, filter: Option<Vec<NodeId>>, removal: Removal) -> BoxFuture<'static, StopReport> {
        match self.me.upgrade() {
            Some(flow) => flow.stop_nodes(filter, removal).boxed(),
            None => future::ready(StopReport::default()).boxed(),
        }
    }

    async fn stop_nodes(self: Arc<Self>, filter: Option<Vec<NodeId>>, removal: Removal) -> StopReport {
        let full = filter.is_none();
        let previous = self.state();
        if full {
            self.set_state(FlowState::Stopping);
        }

        let mut targets: Vec<Arc<NodeHandle>> = {
            let mut active = self.active.write();
            let ids: Vec<NodeId> = match &filter {
                Some(ids) => ids.clone(),
                None => active.keys().cloned().collect(),
            };
            ids.iter().filter_map(|id| active.remove(id)).collect()
        };
        targets.sort_by_key(|h| (h.is_config_node(), h.creation_index()));
        for handle in &targets {
            handle.cancel();
        }

        let timeout = self.engine.close_timeout;
        let closes = targets.into_iter().map(|handle| {
            let removed = removal.contains(handle.id());
            Arc::clone(&self).close_node(handle, removed, timeout)
        });
        let mut report = StopReport::default();
        for part in future::join_all(closes).await {
            report.merge(part);
        }

        self.refresh_receivers();
        if full {
            self.set_state(FlowState::Stopped);
            self.engine.bus.emit(RuntimeEvent::FlowStopped {
                flow_id: self.id.clone(),
                closed: report.closed.len(),
                timed_out: report.timed_out.len(),
                timestamp: Utc::now(),
            });
            tracing::info!(
                "Stopped flow {} ({} closed, {} timed out, {} failed)",
                self.id,
                report.closed.len(),
                report.timed_out.len(),
                report.failed.len()
            );
        } else {
            self.set_state(previous);
        }
        report
    }

    async fn close_node(self: Arc<Self>, handle: Arc<NodeHandle>, removed: bool, timeout: Duration) -> StopReport {
        let mut report = StopReport::default();

        let instance = self.instances.write().remove(handle.id());
        if let Some(instance) = instance {
            let removal = if removed { Removal::All } else { Removal::None };
            report.merge(instance.stop_with(None, removal).await);
        }

        let id = handle.id().to_string();
        match handle.close(removed, timeout).await {
            CloseOutcome::Closed => {
                tracing::debug!("Closed node {}", id);
                self.engine.bus.emit(RuntimeEvent::NodeClosed {
                    flow_id: self.id.clone(),
                    node_id: id.clone(),
                    removed,
                    timestamp: Utc::now(),
                });
                report.closed.push(id);
            }
            CloseOutcome::TimedOut => {
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!("Node {} did not close within {}ms", id, timeout_ms);
                self.engine.bus.emit(RuntimeEvent::NodeCloseTimedOut {
                    flow_id: self.id.clone(),
                    node_id: id.clone(),
                    timeout_ms,
                    timestamp: Utc::now(),
                });
                report.timed_out.push(id);
            }
            CloseOutcome::Failed(e) => {
                tracing::error!("Node {} failed to close: {}", id, e);
                report.failed.push((id, e));
            }
        }
        report
    }

    /// New outer wiring for the usage node of this instance.
    fn rewire_outputs(&self, outer: &[Vec<NodeId>]) {
        let FlowKind::Subflow(binding) = &self.kind else {
            return;
        };
        let nodes = binding.expand(outer);
        for node in &nodes {
            if let Some(handle) = self.active_node(&node.id) {
                if handle.wires().as_slice() != node.wires() {
                    handle.update_wires(&node.wires.clone().unwrap_or_default());
                }
            }
        }
        let mut config = (*self.config()).clone();
        config.nodes = nodes;
        self.update(config);
    }

    /// Hand `msg` to this instance's input node.
    pub(crate) fn deliver_input(&self, msg: Message) {
        let FlowKind::Subflow(binding) = &self.kind else {
            return;
        };
        if let Some(input) = self.active_node(binding.input_id()) {
            input.receive(msg);
        }
    }

    /// A message reached the status or complete port of this instance.
    pub(crate) fn report_port(&self, kind: PortKind, msg: &Message) {
        let FlowKind::Subflow(binding) = &self.kind else {
            return;
        };
        let Some(Level::Flow(parent)) = self.parent_level() else {
            return;
        };
        let origin = Origin::of(binding.usage());
        match kind {
            PortKind::Status => {
                let status = events::status_from_message(msg);
                self.engine.bus.emit(RuntimeEvent::NodeStatus {
                    flow_id: parent.id.clone(),
                    node_id: origin.id.clone(),
                    status: status.clone(),
                    timestamp: Utc::now(),
                });
                parent.handle_status(&origin, &status);
            }
            PortKind::Complete => {
                parent.handle_complete(&origin, msg);
            }
        }
    }

    fn parent_level(&self) -> Option<Level> {
        match &self.parent {
            ParentLink::Root(root) => Some(Level::Root(Arc::clone(root))),
            ParentLink::Flow(flow) => flow.upgrade().map(Level::Flow),
        }
    }

    /// Level above this one and the id the event is reported under there.
    fn bubble(&self, reporting: &mut NodeId) -> Option<Level> {
        if let FlowKind::Subflow(binding) = &self.kind {
            *reporting = binding.usage().id.clone();
        }
        self.parent_level()
    }

    fn intercepts(&self, kind: PortKind) -> bool {
        match (&self.kind, kind) {
            (FlowKind::Subflow(b), PortKind::Status) => b.intercepts_status(),
            (FlowKind::Subflow(b), PortKind::Complete) => b.intercepts_complete(),
            _ => false,
        }
    }

    fn deliver(&self, targets: Vec<NodeId>, msg: impl Fn() -> Message) {
        for id in targets {
            if let Some(receiver) = self.active_node(&id) {
                receiver.receive(msg());
            }
        }
    }

    /// Route a runtime error to the nearest level with a matching catch
    /// receiver. Returns whether anything took it.
    pub fn handle_error(&self, origin: &Origin, text: &str, msg: Option<&Message>) -> bool {
        let count = events::error_count(origin, msg);
        if count >= ERROR_LOOP_LIMIT {
            tracing::warn!("[{}:{}] error loop detected, dropping: {}", origin.node_type, origin.id, text);
            return false;
        }

        let Some(mut level) = self.me.upgrade() else {
            return false;
        };
        let mut reporting = origin.id.clone();
        loop {
            let targets = level.receivers.read().catch_targets(&reporting);
            if !targets.is_empty() {
                level.deliver(targets, || events::error_message(origin, text, msg, count));
                return true;
            }
            match level.bubble(&mut reporting) {
                Some(Level::Flow(parent)) => level = parent,
                Some(Level::Root(root)) => return root.handle_error(origin, text, msg),
                None => return false,
            }
        }
    }

    pub fn handle_status(&self, origin: &Origin, status: &NodeStatus) -> bool {
        let Some(mut level) = self.me.upgrade() else {
            return false;
        };
        let mut reporting = origin.id.clone();
        loop {
            let targets = level.receivers.read().status_targets(&reporting);
            if !targets.is_empty() {
                level.deliver(targets, || events::status_message(origin, status));
                return true;
            }
            if level.intercepts(PortKind::Status) {
                return false;
            }
            match level.bubble(&mut reporting) {
                Some(Level::Flow(parent)) => level = parent,
                Some(Level::Root(root)) => return root.handle_status(origin, status),
                None => return false,
            }
        }
    }

    pub fn handle_complete(&self, origin: &Origin, msg: &Message) -> bool {
        let Some(mut level) = self.me.upgrade() else {
            return false;
        };
        let mut reporting = origin.id.clone();
        loop {
            let targets = level.receivers.read().complete_targets(&reporting);
            if !targets.is_empty() {
                level.deliver(targets, || msg.clone());
                return true;
            }
            if level.intercepts(PortKind::Complete) {
                return false;
            }
            match level.bubble(&mut reporting) {
                Some(Level::Flow(parent)) => level = parent,
                Some(Level::Root(root)) => return root.handle_complete(origin, msg),
                None => return false,
            }
        }
    }

    /// Look up an active node. Without `cancel_bubble` the search
    /// continues in the parent; with it, it descends into this level's
    /// subflow instances instead.
    pub fn get_node(&self, id: &str, cancel_bubble: bool) -> Option<Arc<NodeHandle>> {
        if let Some(handle) = self.active_node(id) {
            return Some(handle);
        }
        if cancel_bubble {
            let instances: Vec<Arc<Flow>> = self.instances.read().values().cloned().collect();
            return instances.iter().find_map(|i| i.get_node(id, true));
        }
        match self.parent_level()? {
            Level::Flow(parent) => parent.get_node(id, false),
            Level::Root(root) => root.get_node(id),
        }
    }

    pub fn active_node(&self, id: &str) -> Option<Arc<NodeHandle>> {
        self.active.read().get(id).cloned()
    }

    /// Active nodes of this level in creation order.
    pub fn active_nodes(&self) -> Vec<Arc<NodeHandle>> {
        let mut nodes: Vec<Arc<NodeHandle>> = self.active.read().values().cloned().collect();
        nodes.sort_by_key(|h| h.creation_index());
        nodes
    }

    pub fn active_node_ids(&self) -> Vec<NodeId> {
        self.active_nodes().iter().map(|h| h.id().to_string()).collect()
    }

    pub fn construction_failures(&self) -> HashMap<NodeId, NodeError> {
        self.failures.read().clone()
    }

    pub fn subflow_instance(&self, usage_id: &str) -> Option<Arc<Flow>> {
        self.instances.read().get(usage_id).cloned()
    }

    /// Instance node created for template node `template_id`.
    pub fn node_by_alias(&self, template_id: &str) -> Option<Arc<NodeHandle>> {
        let FlowKind::Subflow(binding) = &self.kind else {
            return None;
        };
        self.active_node(binding.private_id(template_id)?)
    }

    /// Deliver `msg` to the active node `node_id` as if it had been sent to
    /// it over a wire.
    pub fn inject(&self, node_id: &str, msg: Message) -> Result<(), FlowError> {
        let node = self
            .get_node(node_id, true)
            .ok_or_else(|| FlowError::Lifecycle(format!("Node {} is not active in flow {}", node_id, self.id)))?;
        node.receive(msg);
        Ok(())
    }

    /// Resolve a setting through the scope chain: reserved keys, this
    /// level's env, then each enclosing level. A `$parent.` prefix starts
    /// the search one level up.
    pub fn get_setting(&self, name: &str) -> Option<Value> {
        if let Some(rest) = name.strip_prefix("$parent.") {
            return self.parent_setting(rest);
        }
        match (&self.kind, name) {
            (FlowKind::Tab, "FLOW_ID") => return Some(Value::String(self.id.clone())),
            (FlowKind::Tab, "FLOW_NAME") => {
                if let Some(label) = self.config().label.clone() {
                    return Some(Value::String(label));
                }
            }
            (FlowKind::Subflow(b), "NODE_ID") => return Some(Value::String(b.usage().id.clone())),
            (FlowKind::Subflow(b), "NODE_NAME") => {
                if let Some(name) = b.usage().name() {
                    return Some(Value::String(name.to_string()));
                }
            }
            _ => {}
        }
        if let Some(value) = self.env.read().get(name) {
            return Some(value.clone());
        }
        self.parent_setting(name)
    }

    fn parent_setting(&self, name: &str) -> Option<Value> {
        match self.parent_level()? {
            Level::Flow(parent) => parent.get_setting(name),
            Level::Root(root) => root.get_setting(name),
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active", &self.active.read().len())
            .finish()
    }
}
