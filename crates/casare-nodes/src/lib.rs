//! Built-in action nodes for the CasareRPA execution core
//!
//! The production action library ships separately; this crate carries the
//! small set the engine's own tests and examples rely on, and doubles as
//! the reference for writing external node packs.
//!
//! # Categories
//!
//! - **Variables**: `set-variable`, `append-to-list`
//! - **Utility**: `no-op`, `delay`, `log-message`
//! - **Network**: `http-request`

pub mod http;
pub mod utility;
pub mod variable;

pub use http::{HttpRequestFactory, HttpRequestNode};
pub use utility::{DelayFactory, DelayNode, LogMessageFactory, LogMessageNode, NoOpFactory, NoOpNode};
pub use variable::{AppendToListFactory, AppendToListNode, SetVariableFactory, SetVariableNode};

use std::sync::Arc;

use casare_engine::NodeRegistry;

/// Register every built-in node type
pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.register(Arc::new(SetVariableFactory));
    registry.register(Arc::new(AppendToListFactory));
    registry.register(Arc::new(NoOpFactory));
    registry.register(Arc::new(DelayFactory));
    registry.register(Arc::new(LogMessageFactory));
    registry.register(Arc::new(HttpRequestFactory));
}

/// A registry pre-loaded with the built-ins
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = builtin_registry();
        for type_name in [
            "set-variable",
            "append-to-list",
            "no-op",
            "delay",
            "log-message",
            "http-request",
        ] {
            assert!(registry.has_node_type(type_name), "missing {}", type_name);
        }
    }
}
