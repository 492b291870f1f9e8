use crate::events::Origin;
use crate::flow::Flow;
use crate::router::DispatchTable;
use chrono::Utc;
use flowcore::{
    CloseSignal, Message, Node, NodeConfig, NodeContext, NodeError, NodeLink, NodeStatus,
    RuntimeEvent, Wires,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a node's close resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed,
    TimedOut,
    Failed(NodeError),
}

/// A live node: the instance, its resolved configuration and its wiring.
pub struct NodeHandle {
    config: NodeConfig,
    origin: Origin,
    node: Box<dyn Node>,
    creation_index: u64,
    table: RwLock<DispatchTable>,
    flow: Weak<Flow>,
    cancel: CancellationToken,
    emits_complete: bool,
    me: Weak<NodeHandle>,
}

impl NodeHandle {
    pub(crate) fn new(
        config: NodeConfig,
        node: Box<dyn Node>,
        creation_index: u64,
        flow: Weak<Flow>,
        emits_complete: bool,
    ) -> Arc<Self> {
        let table = DispatchTable::from_wires(config.wires());
        let origin = Origin::of(&config);
        Arc::new_cyclic(|me| Self {
            config,
            origin,
            node,
            creation_index,
            table: RwLock::new(table),
            flow,
            cancel: CancellationToken::new(),
            emits_complete,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn node_type(&self) -> &str {
        &self.config.node_type
    }

    /// Env-resolved configuration the instance was built from
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn creation_index(&self) -> u64 {
        self.creation_index
    }

    pub fn is_config_node(&self) -> bool {
        self.config.is_config_node()
    }

    pub fn wires(&self) -> Wires {
        self.table.read().to_wires()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn context(&self, input: Option<Message>) -> Option<NodeContext> {
        let link: Arc<dyn NodeLink> = self.me.upgrade()?;
        Some(NodeContext::new(link, input))
    }

    pub(crate) fn start(&self) {
        if let Some(ctx) = self.context(None) {
            self.node.on_start(&ctx);
        }
    }

    /// Run the input hook for `msg` to completion on the caller's stack.
    pub fn receive(&self, msg: Message) {
        if self.cancel.is_cancelled() {
            tracing::trace!("Node {} is stopping, dropping message", self.config.id);
            return;
        }
        let Some(ctx) = self.context(Some(msg.clone())) else {
            return;
        };

        let result = catch_unwind(AssertUnwindSafe(|| self.node.on_input(msg, &ctx)))
            .unwrap_or_else(|_| Err(NodeError::ExecutionFailed("input handler panicked".into())));

        match result {
            Ok(()) => {
                if self.emits_complete && !ctx.is_deferred() {
                    if let Some(input) = ctx.input() {
                        self.complete(input);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Node {} failed to handle input: {}", self.config.id, e);
                NodeLink::error(self, &e.to_string(), ctx.input());
            }
        }
    }

    /// Swap the dispatch table in place; the instance is kept.
    pub(crate) fn update_wires(&self, wires: &Wires) {
        *self.table.write() = DispatchTable::from_wires(wires);
        self.node.on_rewire(wires);
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ask the instance to close and wait for its signal, up to `timeout`.
    /// A signal arriving after the deadline is discarded.
    pub(crate) async fn close(&self, removed: bool, timeout: Duration) -> CloseOutcome {
        self.cancel.cancel();
        let (signal, done) = CloseSignal::channel();

        if catch_unwind(AssertUnwindSafe(|| self.node.on_close(removed, signal))).is_err() {
            return CloseOutcome::Failed(NodeError::Close("close handler panicked".into()));
        }

        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(Ok(()))) => CloseOutcome::Closed,
            Ok(Ok(Err(e))) => CloseOutcome::Failed(e),
            // Signal dropped without being fired
            Ok(Err(_)) => CloseOutcome::Closed,
            Err(_) => CloseOutcome::TimedOut,
        }
    }
}

impl NodeLink for NodeHandle {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn node_type(&self) -> &str {
        &self.config.node_type
    }

    fn name(&self) -> Option<&str> {
        self.config.name()
    }

    fn send_port(&self, port: usize, msg: Message) {
        let Some(flow) = self.flow.upgrade() else {
            return;
        };
        let targets = self.table.read().targets(port).to_vec();
        let Some((last, rest)) = targets.split_last() else {
            return;
        };

        for target in rest {
            match flow.get_node(&target.node_id, false) {
                Some(node) => node.receive(msg.clone()),
                None => tracing::debug!("{} -> {}: target not active", self.config.id, target.node_id),
            }
        }
        match flow.get_node(&last.node_id, false) {
            Some(node) => node.receive(msg),
            None => tracing::debug!("{} -> {}: target not active", self.config.id, last.node_id),
        }
    }

    fn status(&self, status: NodeStatus) {
        let Some(flow) = self.flow.upgrade() else {
            return;
        };
        flow.engine().bus.emit(RuntimeEvent::NodeStatus {
            flow_id: flow.id().to_string(),
            node_id: self.config.id.clone(),
            status: status.clone(),
            timestamp: Utc::now(),
        });
        flow.handle_status(&self.origin, &status);
    }

    fn error(&self, text: &str, msg: Option<&Message>) {
        match self.flow.upgrade() {
            Some(flow) => {
                flow.handle_error(&self.origin, text, msg);
            }
            None => tracing::warn!("[{}:{}] {}", self.config.node_type, self.config.id, text),
        }
    }

    fn complete(&self, msg: &Message) {
        if let Some(flow) = self.flow.upgrade() {
            flow.handle_complete(&self.origin, msg);
        }
    }

    fn setting(&self, name: &str) -> Option<Value> {
        self.flow.upgrade()?.get_setting(name)
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.config.id)
            .field("type", &self.config.node_type)
            .field("creation_index", &self.creation_index)
            .finish()
    }
}
