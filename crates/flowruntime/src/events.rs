use flowcore::{Message, Node, NodeConfig, NodeContext, NodeError, NodeId, NodeStatus};
use serde::Serialize;
use serde_json::{json, Value};

pub const CATCH_TYPE: &str = "catch";
pub const STATUS_TYPE: &str = "status";
pub const COMPLETE_TYPE: &str = "complete";

/// Error chains deeper than this from one origin are dropped.
pub const ERROR_LOOP_LIMIT: u64 = 10;

pub fn is_receiver_type(node_type: &str) -> bool {
    matches!(node_type, CATCH_TYPE | STATUS_TYPE | COMPLETE_TYPE)
}

/// The node a signal was raised by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Origin {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: Option<String>,
}

impl Origin {
    pub fn of(config: &NodeConfig) -> Self {
        Self {
            id: config.id.clone(),
            node_type: config.node_type.clone(),
            name: config.name().map(str::to_string),
        }
    }
}

/// Built-in node that forwards whatever it is handed on port 0. Backs the
/// catch/status/complete receivers and subflow inputs.
pub struct RelayNode {
    node_type: String,
}

impl RelayNode {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
        }
    }
}

impl Node for RelayNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn on_input(&self, msg: Message, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.send(msg);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Receiver {
    pub id: NodeId,
    pub scope: Option<Vec<NodeId>>,
    pub uncaught: bool,
}

impl Receiver {
    pub fn from_config(config: &NodeConfig) -> Self {
        let scope = config.property("scope").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        let uncaught = config
            .property("uncaught")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            id: config.id.clone(),
            scope,
            uncaught,
        }
    }

    fn matches(&self, reporting: &str) -> bool {
        match &self.scope {
            Some(ids) => ids.iter().any(|id| id == reporting),
            None => true,
        }
    }
}

/// Receivers declared at one flow level.
#[derive(Debug, Clone, Default)]
pub struct Receivers {
    catch: Vec<Receiver>,
    status: Vec<Receiver>,
    complete: Vec<Receiver>,
}

impl Receivers {
    /// Build from the receiver configs of the level's active nodes, in
    /// creation order.
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a NodeConfig>) -> Self {
        let mut receivers = Self::default();
        for config in configs {
            let receiver = Receiver::from_config(config);
            match config.node_type.as_str() {
                CATCH_TYPE => receivers.catch.push(receiver),
                STATUS_TYPE => receivers.status.push(receiver),
                COMPLETE_TYPE => receivers.complete.push(receiver),
                _ => {}
            }
        }
        // scoped, then unscoped, then the uncaught tier
        receivers.catch.sort_by_key(|r| match (&r.scope, r.uncaught) {
            (Some(_), _) => 0,
            (None, false) => 1,
            (None, true) => 2,
        });
        receivers
    }

    pub fn is_empty(&self) -> bool {
        self.catch.is_empty() && self.status.is_empty() && self.complete.is_empty()
    }

    /// Catch receivers that take an error reported by `reporting`.
    ///
    /// An unscoped `uncaught` receiver only fires when nothing before it
    /// has; once the uncaught tier has been entered, later uncaught
    /// receivers fire as well.
    pub fn catch_targets(&self, reporting: &str) -> Vec<NodeId> {
        let mut targets = Vec::new();
        let mut handled_by_uncaught = false;
        for receiver in &self.catch {
            if !receiver.matches(reporting) {
                continue;
            }
            if receiver.scope.is_none() && receiver.uncaught && !handled_by_uncaught {
                if !targets.is_empty() {
                    continue;
                }
                handled_by_uncaught = true;
            }
            targets.push(receiver.id.clone());
        }
        targets
    }

    pub fn status_targets(&self, reporting: &str) -> Vec<NodeId> {
        self.status
            .iter()
            .filter(|r| r.matches(reporting))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Complete receivers must list their origins; an unscoped one would
    /// take the completions of its own downstream nodes.
    pub fn complete_targets(&self, reporting: &str) -> Vec<NodeId> {
        self.complete
            .iter()
            .filter(|r| r.scope.as_ref().is_some_and(|ids| ids.iter().any(|id| id == reporting)))
            .map(|r| r.id.clone())
            .collect()
    }
}

/// Position of `msg` in an error chain raised by `origin`: 1 for a fresh
/// error, one more than the carried count when the message already holds
/// an error from the same origin.
pub fn error_count(origin: &Origin, msg: Option<&Message>) -> u64 {
    let source = msg
        .and_then(|m| m.get("error"))
        .and_then(|e| e.get("source"));
    match source {
        Some(source) if source.get("id").and_then(Value::as_str) == Some(origin.id.as_str()) => {
            source.get("count").and_then(Value::as_u64).unwrap_or(1) + 1
        }
        _ => 1,
    }
}

/// Message delivered to a catch receiver. A previous error is kept under
/// `_error`.
pub fn error_message(origin: &Origin, text: &str, msg: Option<&Message>, count: u64) -> Message {
    let mut out = msg.cloned().unwrap_or_default();
    if let Some(previous) = out.remove("error") {
        out.insert("_error", previous);
    }
    out.insert(
        "error",
        json!({
            "message": text,
            "source": {
                "id": origin.id,
                "type": origin.node_type,
                "name": origin.name,
                "count": count,
            }
        }),
    );
    out
}

/// Message delivered to a status receiver.
pub fn status_message(origin: &Origin, status: &NodeStatus) -> Message {
    let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert(
            "source".to_string(),
            json!({"id": origin.id, "type": origin.node_type, "name": origin.name}),
        );
    }
    let mut msg = Message::new();
    msg.insert("status", body);
    msg
}

/// Status carried by a message arriving at a subflow status port: the
/// `status` property when present, otherwise the payload as text.
pub fn status_from_message(msg: &Message) -> NodeStatus {
    if let Some(status) = msg
        .get("status")
        .and_then(|s| serde_json::from_value::<NodeStatus>(s.clone()).ok())
    {
        return status;
    }
    match msg.payload() {
        Some(Value::String(s)) => NodeStatus::text(s.clone()),
        Some(Value::Null) | None => NodeStatus::default(),
        Some(other) => NodeStatus::text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(id: &str, node_type: &str, scope: Option<&[&str]>, uncaught: bool) -> NodeConfig {
        let mut config = NodeConfig::new(id, node_type).with_wires(vec![]);
        if let Some(scope) = scope {
            config = config.with_property("scope", json!(scope));
        }
        if uncaught {
            config = config.with_property("uncaught", true);
        }
        config
    }

    fn origin() -> Origin {
        Origin {
            id: "n1".into(),
            node_type: "test".into(),
            name: Some("first".into()),
        }
    }

    #[test]
    fn scoped_receivers_only_take_listed_origins() {
        let configs = vec![
            receiver("s1", STATUS_TYPE, Some(&["a"]), false),
            receiver("s2", STATUS_TYPE, None, false),
        ];
        let receivers = Receivers::from_configs(&configs);
        assert_eq!(receivers.status_targets("a"), vec!["s1", "s2"]);
        assert_eq!(receivers.status_targets("b"), vec!["s2"]);
    }

    #[test]
    fn uncaught_tier_fires_only_when_nothing_else_did() {
        let configs = vec![
            receiver("u", CATCH_TYPE, None, true),
            receiver("all", CATCH_TYPE, None, false),
            receiver("only-a", CATCH_TYPE, Some(&["a"]), false),
        ];
        let receivers = Receivers::from_configs(&configs);
        assert_eq!(receivers.catch_targets("a"), vec!["only-a", "all"]);

        let uncaught_only = Receivers::from_configs(&configs[..1]);
        assert_eq!(uncaught_only.catch_targets("a"), vec!["u"]);

        let scoped_and_uncaught = vec![configs[0].clone(), configs[2].clone()];
        let receivers = Receivers::from_configs(&scoped_and_uncaught);
        assert_eq!(receivers.catch_targets("a"), vec!["only-a"]);
        assert_eq!(receivers.catch_targets("b"), vec!["u"]);
    }

    #[test]
    fn complete_receivers_need_a_scope() {
        let configs = vec![
            receiver("c1", COMPLETE_TYPE, Some(&["a", "b"]), false),
            receiver("c2", COMPLETE_TYPE, None, false),
        ];
        let receivers = Receivers::from_configs(&configs);
        assert_eq!(receivers.complete_targets("a"), vec!["c1"]);
        assert_eq!(receivers.complete_targets("b"), vec!["c1"]);
        assert!(receivers.complete_targets("z").is_empty());
    }

    #[test]
    fn error_message_keeps_previous_error() {
        let first = error_message(&origin(), "boom", None, 1);
        assert_eq!(first.get("error").unwrap()["source"]["count"], json!(1));
        assert!(!first.contains_key("_error"));

        let other = Origin {
            id: "n2".into(),
            ..origin()
        };
        let second = error_message(&other, "again", Some(&first), error_count(&other, Some(&first)));
        assert_eq!(second.get("_error"), first.get("error"));
        assert_eq!(second.get("error").unwrap()["message"], json!("again"));
        assert_eq!(second.get("error").unwrap()["source"]["id"], json!("n2"));
    }

    #[test]
    fn error_count_grows_for_the_same_origin() {
        let first = error_message(&origin(), "boom", None, 1);
        assert_eq!(error_count(&origin(), Some(&first)), 2);

        let ninth = error_message(&origin(), "boom", None, 9);
        assert_eq!(error_count(&origin(), Some(&ninth)), ERROR_LOOP_LIMIT);
    }

    #[test]
    fn status_message_carries_source() {
        let msg = status_message(&origin(), &NodeStatus::new("red", "dot", "down"));
        let status = msg.get("status").unwrap();
        assert_eq!(status["fill"], json!("red"));
        assert_eq!(status["text"], json!("down"));
        assert_eq!(status["source"], json!({"id": "n1", "type": "test", "name": "first"}));
    }

    #[test]
    fn port_status_falls_back_to_payload_text() {
        let mut msg = Message::with_payload(42);
        assert_eq!(status_from_message(&msg), NodeStatus::text("42"));
        msg.insert("status", json!({"fill": "green", "text": "ok"}));
        assert_eq!(
            status_from_message(&msg),
            NodeStatus {
                fill: Some("green".into()),
                shape: None,
                text: Some("ok".into()),
            }
        );
    }
}
