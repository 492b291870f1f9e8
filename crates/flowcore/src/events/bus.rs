use crate::{NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    FlowStarted {
        flow_id: String,
        active_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    FlowStopped {
        flow_id: String,
        closed: usize,
        timed_out: usize,
        timestamp: DateTime<Utc>,
    },
    NodeStatus {
        flow_id: String,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        flow_id: String,
        node_id: NodeId,
        node_type: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeClosed {
        flow_id: String,
        node_id: NodeId,
        removed: bool,
        timestamp: DateTime<Utc>,
    },
    NodeCloseTimedOut {
        flow_id: String,
        node_id: NodeId,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },
    UnhandledError {
        node_id: NodeId,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl RuntimeEvent {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            RuntimeEvent::NodeStatus { node_id, .. }
            | RuntimeEvent::NodeFailed { node_id, .. }
            | RuntimeEvent::NodeClosed { node_id, .. }
            | RuntimeEvent::NodeCloseTimedOut { node_id, .. }
            | RuntimeEvent::UnhandledError { node_id, .. } => Some(node_id),
            RuntimeEvent::FlowStarted { .. } | RuntimeEvent::FlowStopped { .. } => None,
        }
    }
}

/// Broadcast bus for runtime events. Publishing never blocks and never
/// fails, with or without subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(?event, "No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
