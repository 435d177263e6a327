//! Connections (edges) between node ports

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PortName};

/// A directed edge between two ports.
///
/// Execution edges connect execution ports and drive control flow; data
/// edges connect data ports and carry values. The kind is derived from the
/// port types, not stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(alias = "source_node")]
    pub source_node: NodeId,
    #[serde(alias = "source_port")]
    pub source_port: PortName,
    #[serde(alias = "target_node")]
    pub target_node: NodeId,
    #[serde(alias = "target_port")]
    pub target_port: PortName,
}

impl Connection {
    pub fn new(
        source_node: impl Into<String>,
        source_port: impl Into<String>,
        target_node: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            source_port: source_port.into(),
            target_node: target_node.into(),
            target_port: target_port.into(),
        }
    }

    /// The `(node, port)` pair this edge leaves from
    pub fn source(&self) -> (&str, &str) {
        (&self.source_node, &self.source_port)
    }

    /// The `(node, port)` pair this edge arrives at
    pub fn target(&self) -> (&str, &str) {
        (&self.target_node, &self.target_port)
    }
}
