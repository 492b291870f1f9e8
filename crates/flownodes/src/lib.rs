//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod fail;
mod time;
mod transform;

pub use debug::{DebugNode, DebugNodeFactory};
pub use fail::{FailNode, FailNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};
pub use transform::{ChangeNode, ChangeNodeFactory, JsonNode, JsonNodeFactory};
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(DebugNodeFactory));
    registry.register(Arc::new(DelayNodeFactory));
    registry.register(Arc::new(JsonNodeFactory));
    registry.register(Arc::new(ChangeNodeFactory));
    registry.register(Arc::new(FailNodeFactory));
}
