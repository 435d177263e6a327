//! Node type registry
//!
//! Maps `type_name` to a factory plus metadata. The registry also acts as
//! the [`PortCatalog`] the loader validates against: control kinds derive
//! their ports statically, action nodes get an implicit execution
//! in/out pair around their declared data ports.

use std::collections::HashMap;
use std::sync::Arc;

use casare_workflow::{
    CoreNodeKind, NodePorts, NodeRecord, PortCatalog, PortDefinition,
};

use crate::error::{EngineError, Result};
use crate::node::Node;
use crate::resources::ResourceKind;
use crate::retry::RetryPolicy;

/// Metadata a node type declares about itself
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    /// Unique type identifier (e.g. "http-request")
    pub type_name: String,
    /// Human-readable label
    pub label: String,
    /// What the node does
    pub description: String,
    /// Data input ports
    pub inputs: Vec<PortDefinition>,
    /// Data output ports
    pub outputs: Vec<PortDefinition>,
    /// Resource kinds the node borrows during execution
    pub resources: Vec<ResourceKind>,
    /// Offload execution to the blocking pool
    pub cpu_bound: bool,
    /// Default retry policy; node config may override it
    pub retry: RetryPolicy,
}

impl NodeMetadata {
    pub fn new(type_name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            label: label.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: Vec::new(),
            cpu_bound: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_resource(mut self, kind: ResourceKind) -> Self {
        self.resources.push(kind);
        self
    }

    pub fn cpu_bound(mut self) -> Self {
        self.cpu_bound = true;
        self
    }
}

/// Creates node instances from design-time config
pub trait NodeFactory: Send + Sync {
    /// Static metadata for this node type
    fn metadata(&self) -> NodeMetadata;

    /// Build a node for one workflow run
    fn create(&self, config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>>;
}

/// Registry of node types
#[derive(Default)]
pub struct NodeRegistry {
    entries: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its metadata type name. Later
    /// registrations replace earlier ones.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let type_name = factory.metadata().type_name;
        if self.entries.insert(type_name.clone(), factory).is_some() {
            log::warn!("node type '{}' re-registered", type_name);
        }
    }

    /// Merge another registry's entries into this one
    pub fn merge(&mut self, other: NodeRegistry) {
        for (type_name, factory) in other.entries {
            self.entries.insert(type_name, factory);
        }
    }

    pub fn has_node_type(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Look up a factory, failing with `UnknownNodeType`
    pub fn factory(&self, type_name: &str) -> Result<&Arc<dyn NodeFactory>> {
        self.entries
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownNodeType {
                type_name: type_name.to_string(),
            })
    }

    /// Instantiate a node for the given record
    pub fn create(&self, record: &NodeRecord) -> Result<Arc<dyn Node>> {
        self.factory(&record.type_name)?.create(&record.config)
    }

    /// Metadata for a registered type
    pub fn metadata(&self, type_name: &str) -> Result<NodeMetadata> {
        Ok(self.factory(type_name)?.metadata())
    }

    /// Metadata for every registered type
    pub fn all_metadata(&self) -> Vec<NodeMetadata> {
        self.entries.values().map(|f| f.metadata()).collect()
    }
}

impl PortCatalog for NodeRegistry {
    fn ports(&self, node: &NodeRecord) -> Option<NodePorts> {
        let kind = node.kind();
        if kind != CoreNodeKind::Action {
            return kind.derive_ports(&node.config);
        }
        let meta = self.entries.get(&node.type_name)?.metadata();
        let mut inputs = vec![PortDefinition::execution("exec_in")];
        inputs.extend(meta.inputs);
        let mut outputs = vec![PortDefinition::execution("exec_out")];
        outputs.extend(meta.outputs);
        Some(NodePorts::new(inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeContext;
    use crate::node::NodeResult;
    use async_trait::async_trait;
    use casare_workflow::PortDataType;

    struct EchoNode;

    #[async_trait]
    impl Node for EchoNode {
        fn input_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition::optional("value", PortDataType::Any)]
        }

        fn output_ports(&self) -> Vec<PortDefinition> {
            vec![PortDefinition::optional("value", PortDataType::Any)]
        }

        async fn execute(&self, _ctx: &NodeContext) -> NodeResult {
            NodeResult::ok()
        }
    }

    struct EchoFactory;

    impl NodeFactory for EchoFactory {
        fn metadata(&self) -> NodeMetadata {
            NodeMetadata::new("echo", "Echo")
                .with_input(PortDefinition::optional("value", PortDataType::Any))
                .with_output(PortDefinition::optional("value", PortDataType::Any))
        }

        fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
            Ok(Arc::new(EchoNode))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoFactory));
        assert!(registry.has_node_type("echo"));
        assert!(registry.factory("echo").is_ok());
        assert!(matches!(
            registry.factory("missing"),
            Err(EngineError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn test_catalog_wraps_action_ports_with_exec_pair() {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoFactory));
        let record = NodeRecord::new("n1", "echo");
        let ports = registry.ports(&record).unwrap();
        assert!(ports.input("exec_in").is_some());
        assert!(ports.input("value").is_some());
        assert_eq!(ports.exec_outputs(), vec!["exec_out"]);
    }

    #[test]
    fn test_catalog_derives_control_ports() {
        let registry = NodeRegistry::new();
        let record = NodeRecord::new("i1", "If");
        let ports = registry.ports(&record).unwrap();
        assert_eq!(ports.exec_outputs(), vec!["true", "false"]);
    }
}
