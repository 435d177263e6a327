//! The workflow container
//!
//! A `Workflow` is immutable after load. All runtime state lives in the
//! engine's execution context, keyed by node and port ids.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::node::NodeRecord;
use crate::types::NodeId;
use crate::variables::VariableDef;

/// Current document schema version
pub const WORKFLOW_VERSION: u32 = 1;

/// A complete workflow: nodes, connections and workflow-scope variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Document schema version
    pub version: u32,
    /// Unique identifier for this workflow
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Nodes keyed by node id
    pub nodes: HashMap<NodeId, NodeRecord>,
    /// Edges between node ports
    pub connections: Vec<Connection>,
    /// Workflow-scope variable declarations
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    /// Free-form metadata, opaque to the engine
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Workflow {
    /// Create an empty workflow shell (used by tests and builders)
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: WORKFLOW_VERSION,
            id: id.into(),
            name: name.into(),
            nodes: HashMap::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Add a node (builder style)
    pub fn with_node(mut self, node: NodeRecord) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Add a connection (builder style)
    pub fn with_connection(mut self, conn: Connection) -> Self {
        self.connections.push(conn);
        self
    }

    /// Add a variable declaration (builder style)
    pub fn with_variable(mut self, var: VariableDef) -> Self {
        self.variables.push(var);
        self
    }

    /// Find a node by id
    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    /// Edges arriving at a node
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.target_node == node_id)
    }

    /// Edges leaving a node
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.source_node == node_id)
    }

    /// Edges leaving a specific output port
    pub fn outgoing_from_port<'a>(
        &'a self,
        node_id: &'a str,
        port: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.outgoing(node_id).filter(move |c| c.source_port == port)
    }

    /// Stable content hash used as the execution-plan cache key.
    ///
    /// Node and connection order do not affect the hash.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.version.hash(&mut hasher);
        self.id.hash(&mut hasher);

        let mut node_ids: Vec<&NodeId> = self.nodes.keys().collect();
        node_ids.sort();
        for id in node_ids {
            let node = &self.nodes[id];
            node.id.hash(&mut hasher);
            node.type_name.hash(&mut hasher);
            let mut keys: Vec<&String> = node.config.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(&mut hasher);
                node.config[key].to_string().hash(&mut hasher);
            }
        }

        let mut edges: Vec<String> = self
            .connections
            .iter()
            .map(|c| {
                format!(
                    "{}:{}>{}:{}",
                    c.source_node, c.source_port, c.target_node, c.target_port
                )
            })
            .collect();
        edges.sort();
        edges.hash(&mut hasher);

        let mut vars: Vec<String> = self
            .variables
            .iter()
            .map(|v| format!("{}={}", v.name, v.value))
            .collect();
        vars.sort();
        vars.hash(&mut hasher);

        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VariableType;

    #[test]
    fn test_edge_lookups() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("a", "Start"))
            .with_node(NodeRecord::new("b", "End"))
            .with_connection(Connection::new("a", "exec_out", "b", "exec_in"));

        assert_eq!(wf.outgoing("a").count(), 1);
        assert_eq!(wf.incoming("b").count(), 1);
        assert_eq!(wf.outgoing_from_port("a", "exec_out").count(), 1);
        assert_eq!(wf.outgoing_from_port("a", "other").count(), 0);
    }

    #[test]
    fn test_content_hash_ignores_order() {
        let a = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("a", "Start"))
            .with_node(NodeRecord::new("b", "End"))
            .with_variable(VariableDef::new("x", VariableType::Integer, 1.into()));
        let mut b = a.clone();
        // Re-insert nodes in a different order
        let node = b.nodes.remove("a").unwrap();
        b.nodes.insert("a".to_string(), node);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_changes_with_config() {
        let a = Workflow::new("wf", "Test").with_node(NodeRecord::new("a", "Start"));
        let b = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("a", "Start").with_config("k", serde_json::json!(1)));
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
