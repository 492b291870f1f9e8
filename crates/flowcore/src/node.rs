use crate::{Message, NodeError, NodeStatus, Wires};
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Core trait that every live node implements.
///
/// All hooks are synchronous and run on the engine's cooperative scheduler.
/// Work that outlives a hook is spawned by the node itself and reports back
/// through a [`Completion`] or a [`CloseSignal`].
pub trait Node: Send + Sync {
    /// Type identifier this instance was built for (e.g. "debug", "delay")
    fn node_type(&self) -> &str;

    /// Called once after the node has been registered as active.
    fn on_start(&self, _ctx: &NodeContext) {}

    /// Handle one inbound message.
    ///
    /// Returning `Ok` without calling [`NodeContext::defer`] completes the
    /// message. Returning `Err` raises a runtime error against the input.
    fn on_input(&self, _msg: Message, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Release resources. `removed` is true when the node is being deleted
    /// rather than restarted. The engine waits for `done` up to the close
    /// timeout; a dropped signal counts as closed.
    fn on_close(&self, _removed: bool, done: CloseSignal) {
        done.closed();
    }

    /// The node's outbound wiring was replaced without recreating it.
    fn on_rewire(&self, _wires: &Wires) {}
}

/// The engine side of a live node: dispatch and signal routing.
pub trait NodeLink: Send + Sync {
    fn id(&self) -> &str;

    fn node_type(&self) -> &str;

    fn name(&self) -> Option<&str>;

    /// Deliver `msg` to every target wired to output `port`.
    fn send_port(&self, port: usize, msg: Message);

    fn status(&self, status: NodeStatus);

    fn error(&self, text: &str, msg: Option<&Message>);

    fn complete(&self, msg: &Message);

    /// Look up a setting through the node's environment scope chain.
    fn setting(&self, name: &str) -> Option<Value>;

    fn cancellation(&self) -> &CancellationToken;
}

/// Per-invocation context handed to node hooks.
pub struct NodeContext {
    link: Arc<dyn NodeLink>,
    input: Option<Message>,
    deferred: Cell<bool>,
}

impl NodeContext {
    pub fn new(link: Arc<dyn NodeLink>, input: Option<Message>) -> Self {
        Self {
            link,
            input,
            deferred: Cell::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.link.id()
    }

    pub fn node_type(&self) -> &str {
        self.link.node_type()
    }

    pub fn name(&self) -> Option<&str> {
        self.link.name()
    }

    /// The message being handled, if this context belongs to an input.
    pub fn input(&self) -> Option<&Message> {
        self.input.as_ref()
    }

    /// Send on output port 0
    pub fn send(&self, msg: Message) {
        self.link.send_port(0, msg);
    }

    pub fn send_to(&self, port: usize, msg: Message) {
        self.link.send_port(port, msg);
    }

    /// Send one message per port; `None` entries are skipped.
    pub fn send_ports(&self, msgs: Vec<Option<Message>>) {
        for (port, msg) in msgs.into_iter().enumerate() {
            if let Some(msg) = msg {
                self.link.send_port(port, msg);
            }
        }
    }

    pub fn status(&self, status: NodeStatus) {
        self.link.status(status);
    }

    /// Raise a runtime error against the current input message.
    pub fn error(&self, err: impl fmt::Display) {
        self.link.error(&err.to_string(), self.input.as_ref());
    }

    pub fn env(&self, name: &str) -> Option<Value> {
        self.link.setting(name)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.link.cancellation().clone()
    }

    pub fn link(&self) -> Arc<dyn NodeLink> {
        Arc::clone(&self.link)
    }

    /// Take over completion of the current input. The engine will not emit
    /// a `complete` event for it when the hook returns.
    pub fn defer(&self) -> Completion {
        self.deferred.set(true);
        Completion {
            link: Arc::clone(&self.link),
            msg: self.input.clone(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.get()
    }
}

/// Completion handle for work that finishes after `on_input` returned.
pub struct Completion {
    link: Arc<dyn NodeLink>,
    msg: Option<Message>,
}

impl Completion {
    pub fn send(&self, msg: Message) {
        self.link.send_port(0, msg);
    }

    pub fn send_to(&self, port: usize, msg: Message) {
        self.link.send_port(port, msg);
    }

    pub fn is_cancelled(&self) -> bool {
        self.link.cancellation().is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.link.cancellation().clone()
    }

    pub fn done(self) {
        if let Some(msg) = &self.msg {
            self.link.complete(msg);
        }
    }

    pub fn fail(self, err: impl fmt::Display) {
        self.link.error(&err.to_string(), self.msg.as_ref());
    }
}

/// One-shot acknowledgement of an asynchronous close.
pub struct CloseSignal(oneshot::Sender<Result<(), NodeError>>);

impl CloseSignal {
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), NodeError>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn closed(self) {
        // The engine may have given up waiting already
        let _ = self.0.send(Ok(()));
    }

    pub fn failed(self, err: NodeError) {
        let _ = self.0.send(Err(err));
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("abandoned", &self.0.is_closed())
            .finish()
    }
}
