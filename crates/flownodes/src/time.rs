use flowcore::{CloseSignal, Message, Node, NodeConfig, NodeContext, NodeError, NodeStatus};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use futures::future;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Holds each message for `delay_ms` before passing it on.
///
/// The message is completed only once it has been sent. Pending messages
/// are dropped when the node stops; close resolves after every pending
/// timer has wound down.
pub struct DelayNode {
    delay: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl DelayNode {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.len()
    }
}

impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    fn on_input(&self, msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NodeError::ExecutionFailed(format!("delay needs a tokio runtime: {}", e)))?;

        let completion = ctx.defer();
        let cancel = completion.cancellation();
        let delay = self.delay;
        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    completion.send(msg);
                    completion.done();
                }
                _ = cancel.cancelled() => {
                    tracing::trace!("Delay cancelled, dropping message");
                }
            }
        });
        self.pending.lock().push(handle);

        let waiting = self.pending_count();
        ctx.status(NodeStatus::new("blue", "ring", waiting.to_string()));
        Ok(())
    }

    fn on_close(&self, _removed: bool, done: CloseSignal) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            done.closed();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    future::join_all(pending).await;
                    done.closed();
                });
            }
            Err(_) => {
                for handle in &pending {
                    handle.abort();
                }
                done.closed();
            }
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let delay_ms = match config.property("delay_ms") {
            None => 1000,
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                NodeError::Configuration(format!("delay_ms must be a non-negative integer, got {}", n))
            })?,
            Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                NodeError::Configuration(format!("delay_ms is not a number: {}", s))
            })?,
            Some(other) => {
                return Err(NodeError::Configuration(format!(
                    "delay_ms is not a number: {}",
                    other
                )))
            }
        };
        Ok(Box::new(DelayNode::new(Duration::from_millis(delay_ms))))
    }

    fn node_type(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay each message for delay_ms milliseconds".to_string(),
            category: "function".to_string(),
            inputs: vec![PortDefinition::new("in", "message to delay")],
            outputs: vec![PortDefinition::new("out", "the same message, later")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delay_accepts_numbers_and_numeric_strings() {
        let factory = DelayNodeFactory;
        assert!(factory.create(&NodeConfig::new("d", "delay")).is_ok());
        assert!(factory
            .create(&NodeConfig::new("d", "delay").with_property("delay_ms", "250"))
            .is_ok());

        let err = factory
            .create(&NodeConfig::new("d", "delay").with_property("delay_ms", json!(-5)))
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Configuration(_)));

        let err = factory
            .create(&NodeConfig::new("d", "delay").with_property("delay_ms", "soon"))
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Configuration(_)));
    }
}
