use crate::config::{parse_config, ParsedConfig};
use crate::dependency;
use crate::diff::{diff_configs, FlowDiff};
use crate::events::Origin;
use crate::flow::{EngineContext, Flow, FlowParent, StopReport};
use crate::handle::NodeHandle;
use crate::registry::NodeRegistry;
use chrono::Utc;
use flowcore::{
    ConfigError, EventBus, FlowConfig, FlowError, Message, NodeId, NodeStatus, RuntimeEvent,
};
use futures::future;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Milliseconds `stop()` waits for each node's close signal
    pub node_close_timeout: u64,
    pub event_buffer_size: usize,
    /// Global settings, consulted before the process environment
    pub env: HashMap<String, Value>,
}

impl RuntimeConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.node_close_timeout)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_close_timeout: 15_000,
            event_buffer_size: 1000,
            env: HashMap::new(),
        }
    }
}

/// How a redeploy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployKind {
    /// Stop everything and start the new generation
    Full,
    /// Restart only what changed; rewire the rest in place
    Nodes,
}

struct RuntimeCore {
    engine: Arc<EngineContext>,
    settings: HashMap<String, Value>,
    active_config: RwLock<Option<ParsedConfig>>,
    global: RwLock<Option<Arc<Flow>>>,
    flows: RwLock<Vec<Arc<Flow>>>,
}

impl RuntimeCore {
    fn find_node(&self, id: &str) -> Option<Arc<NodeHandle>> {
        let global = self.global.read().clone();
        if let Some(node) = global.and_then(|g| g.get_node(id, true)) {
            return Some(node);
        }
        let flows = self.flows.read().clone();
        flows.iter().find_map(|f| f.get_node(id, true))
    }
}

/// Top of every flow's parent chain.
struct RootParent {
    core: Weak<RuntimeCore>,
}

impl FlowParent for RootParent {
    fn get_setting(&self, name: &str) -> Option<Value> {
        let core = self.core.upgrade()?;
        core.settings
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok().map(Value::String))
    }

    fn handle_error(&self, origin: &Origin, text: &str, _msg: Option<&Message>) -> bool {
        tracing::warn!("[{}:{}] unhandled error: {}", origin.node_type, origin.id, text);
        if let Some(core) = self.core.upgrade() {
            core.engine.bus.emit(RuntimeEvent::UnhandledError {
                node_id: origin.id.clone(),
                message: text.to_string(),
                timestamp: Utc::now(),
            });
        }
        false
    }

    fn handle_status(&self, _origin: &Origin, _status: &NodeStatus) -> bool {
        false
    }

    fn get_node(&self, id: &str) -> Option<Arc<NodeHandle>> {
        self.core.upgrade()?.find_node(id)
    }
}

/// Runs a whole deployment: the global scope plus one flow per tab.
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    core: Arc<RuntimeCore>,
}

impl FlowRuntime {
    pub fn new(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let engine = EngineContext::new(Arc::clone(&registry), &config);
        let core = Arc::new(RuntimeCore {
            engine,
            settings: config.env,
            active_config: RwLock::new(None),
            global: RwLock::new(None),
            flows: RwLock::new(Vec::new()),
        });
        Self { registry, core }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Subscribe to runtime events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.core.engine.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.core.engine.bus
    }

    fn parent(&self) -> Arc<dyn FlowParent> {
        Arc::new(RootParent {
            core: Arc::downgrade(&self.core),
        })
    }

    fn validate(config: &ParsedConfig) -> Result<(), ConfigError> {
        dependency::validate_flow(&config.global)?;
        for flow in &config.flows {
            dependency::validate_flow(flow)?;
        }
        Ok(())
    }

    /// Parse `records` and start them. Fails if something is running.
    pub async fn load(&self, records: &[Value]) -> Result<(), FlowError> {
        if self.core.active_config.read().is_some() {
            return Err(FlowError::Lifecycle(
                "Runtime already has a deployment; use deploy()".into(),
            ));
        }
        let config = parse_config(records)?;
        self.start_config(config).await
    }

    async fn start_config(&self, config: ParsedConfig) -> Result<(), FlowError> {
        Self::validate(&config)?;

        let global = Flow::new_global(
            config.global.clone(),
            self.parent(),
            Arc::clone(&self.core.engine),
        );
        *self.core.global.write() = Some(Arc::clone(&global));
        global.start(None).await?;

        for tab in &config.flows {
            if let Some(flow) = self.start_tab(tab).await? {
                self.core.flows.write().push(flow);
            }
        }

        tracing::info!(
            "Deployment started: {} flows, {} subflow templates",
            config.flows.len(),
            config.subflows.len()
        );
        *self.core.active_config.write() = Some(config);
        Ok(())
    }

    async fn start_tab(&self, tab: &FlowConfig) -> Result<Option<Arc<Flow>>, FlowError> {
        if tab.disabled {
            tracing::debug!("Flow {} is disabled, not starting", tab.id);
            return Ok(None);
        }
        let flow = Flow::new(tab.clone(), self.parent(), Arc::clone(&self.core.engine));
        flow.start(None).await?;
        Ok(Some(flow))
    }

    /// Replace the running deployment with `records`.
    ///
    /// The new generation is validated before anything is touched. With
    /// [`DeployKind::Nodes`] every changed or removed node is stopped
    /// first, across all flows, then each surviving flow applies the diff;
    /// tabs whose own settings changed are restarted whole.
    pub async fn deploy(&self, records: &[Value], kind: DeployKind) -> Result<FlowDiff, FlowError> {
        let next = parse_config(records)?;
        Self::validate(&next)?;

        let previous = self.core.active_config.read().clone();
        let Some(previous) = previous else {
            let diff = diff_configs(&parse_config(&[])?, &next);
            self.start_config(next).await?;
            return Ok(diff);
        };
        let diff = diff_configs(&previous, &next);

        match kind {
            DeployKind::Full => {
                self.stop_all().await;
                self.start_config(next).await?;
            }
            DeployKind::Nodes => {
                self.deploy_nodes(&previous, next, &diff).await?;
            }
        }
        tracing::info!(
            "Deployed: {} added, {} changed, {} removed, {} rewired",
            diff.added.len(),
            diff.changed.len(),
            diff.removed.len(),
            diff.rewired.len()
        );
        Ok(diff)
    }

    async fn deploy_nodes(
        &self,
        previous: &ParsedConfig,
        next: ParsedConfig,
        diff: &FlowDiff,
    ) -> Result<(), FlowError> {
        let flows = self.core.flows.read().clone();
        let global = self.core.global.read().clone();

        let (keep, restart): (Vec<Arc<Flow>>, Vec<Arc<Flow>>) = flows.into_iter().partition(|f| {
            match (previous.flow(f.id()), next.flow(f.id())) {
                (Some(old), Some(new)) => {
                    !new.disabled && old.label == new.label && old.env == new.env
                }
                _ => false,
            }
        });

        future::join_all(restart.iter().map(|f| f.stop(None, Some(diff.removed.clone())))).await;

        // Users of global config nodes live in the tabs, so tabs go first
        let stale: Vec<NodeId> = diff.changed.iter().chain(&diff.removed).cloned().collect();
        let stop_stale = |flow: &Arc<Flow>| {
            let ids: Vec<NodeId> = stale
                .iter()
                .filter(|id| flow.active_node(id).is_some())
                .cloned()
                .collect();
            flow.stop(Some(ids), Some(diff.removed.clone()))
        };
        future::join_all(keep.iter().map(stop_stale)).await;
        if let Some(global) = &global {
            stop_stale(global).await;
        }

        if let Some(global) = &global {
            global.update(next.global.clone());
            global.start(Some(diff)).await?;
        }

        let mut running = Vec::with_capacity(next.flows.len());
        for tab in &next.flows {
            match keep.iter().find(|f| f.id() == tab.id) {
                Some(flow) => {
                    flow.update(tab.clone());
                    flow.start(Some(diff)).await?;
                    running.push(Arc::clone(flow));
                }
                None => {
                    if let Some(flow) = self.start_tab(tab).await? {
                        running.push(flow);
                    }
                }
            }
        }

        *self.core.flows.write() = running;
        *self.core.active_config.write() = Some(next);
        Ok(())
    }

    /// Stop every flow, tabs first and the global scope last.
    pub async fn stop_all(&self) -> StopReport {
        let flows = std::mem::take(&mut *self.core.flows.write());
        let global = self.core.global.write().take();

        let mut report = StopReport::default();
        for part in future::join_all(flows.iter().map(|f| f.stop(None, None))).await {
            report.merge(part);
        }
        if let Some(global) = global {
            report.merge(global.stop(None, None).await);
        }
        *self.core.active_config.write() = None;
        report
    }

    pub fn get_flow(&self, id: &str) -> Option<Arc<Flow>> {
        if let Some(global) = self.core.global.read().as_ref() {
            if global.id() == id {
                return Some(Arc::clone(global));
            }
        }
        self.core.flows.read().iter().find(|f| f.id() == id).cloned()
    }

    pub fn flow_ids(&self) -> Vec<String> {
        self.core.flows.read().iter().map(|f| f.id().to_string()).collect()
    }

    /// Find an active node anywhere, including inside subflow instances.
    pub fn get_node(&self, id: &str) -> Option<Arc<NodeHandle>> {
        self.core.find_node(id)
    }

    pub fn inject(&self, node_id: &str, msg: Message) -> Result<(), FlowError> {
        let node = self
            .get_node(node_id)
            .ok_or_else(|| FlowError::Lifecycle(format!("Node {} is not active", node_id)))?;
        node.receive(msg);
        Ok(())
    }

    pub fn active_config(&self) -> Option<ParsedConfig> {
        self.core.active_config.read().clone()
    }
}
