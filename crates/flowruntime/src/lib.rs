//! Flow execution runtime
//!
//! Parses a flat list of node records into flows, resolves their config
//! node dependencies and environment references, instantiates nodes through
//! the registry, routes messages along wires, expands subflows into private
//! instances and routes catch/status/complete events between scopes.

pub mod config;
pub mod dependency;
mod diff;
pub mod env;
pub mod events;
mod flow;
mod handle;
mod registry;
mod router;
mod runtime;
pub mod subflow;

pub use config::{parse_config, ParsedConfig, GLOBAL_FLOW_ID};
pub use diff::{diff_configs, FlowDiff};
pub use events::Origin;
pub use flow::{EngineContext, Flow, FlowKind, FlowParent, FlowState, StandaloneParent, StopReport};
pub use handle::{CloseOutcome, NodeHandle};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use router::{DispatchTable, Target};
pub use runtime::{DeployKind, FlowRuntime, RuntimeConfig};
