//! Core port types for workflow graphs
//!
//! Ports are the typed endpoints of a node. Execution ports carry control
//! flow; data ports carry typed values along data edges.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node within a workflow
pub type NodeId = String;

/// Name of a port on a node
pub type PortName = String;

/// The data type of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDataType {
    /// Control-flow port; matches only other execution ports
    Execution,
    /// Text string
    String,
    /// Signed integer
    Integer,
    /// Floating point number
    Float,
    /// Boolean value
    Boolean,
    /// Ordered list of values
    List,
    /// String-keyed mapping
    Dict,
    /// Accepts any data type
    Any,
    /// Reference to an open browser page
    Page,
    /// Reference to a browser instance
    Browser,
    /// Reference to a database connection
    DatabaseConnection,
    /// Raw bytes
    Binary,
}

impl PortDataType {
    /// Check whether a value of this type may flow into a port of `target`.
    ///
    /// `Execution` only matches `Execution`; for data types the match is
    /// exact, or either side is `Any`.
    pub fn is_compatible_with(&self, target: &PortDataType) -> bool {
        match (self, target) {
            (PortDataType::Execution, PortDataType::Execution) => true,
            (PortDataType::Execution, _) | (_, PortDataType::Execution) => false,
            (PortDataType::Any, _) | (_, PortDataType::Any) => true,
            (a, b) => a == b,
        }
    }

    /// Whether this is the control-flow port type
    pub fn is_execution(&self) -> bool {
        matches!(self, PortDataType::Execution)
    }
}

/// Whether a port is an input or an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Definition of a port (input or output) on a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    /// Port name, unique per node and direction
    pub name: PortName,
    /// Data type of the port
    pub data_type: PortDataType,
    /// Whether this input must receive a value (edge, config or default)
    pub required: bool,
    /// Default value for optional inputs
    pub default_value: Option<serde_json::Value>,
}

impl PortDefinition {
    /// Create a required port
    pub fn required(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: true,
            default_value: None,
        }
    }

    /// Create an optional port
    pub fn optional(name: impl Into<String>, data_type: PortDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
            default_value: None,
        }
    }

    /// Create an execution port
    pub fn execution(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: PortDataType::Execution,
            required: false,
            default_value: None,
        }
    }

    /// Set a default value for this port
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// The derived port set of a node: inputs and outputs in declaration order
#[derive(Debug, Clone, Default)]
pub struct NodePorts {
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl NodePorts {
    pub fn new(inputs: Vec<PortDefinition>, outputs: Vec<PortDefinition>) -> Self {
        Self { inputs, outputs }
    }

    /// Find an input port by name
    pub fn input(&self, name: &str) -> Option<&PortDefinition> {
        self.inputs.iter().find(|p| p.name == name)
    }

    /// Find an output port by name
    pub fn output(&self, name: &str) -> Option<&PortDefinition> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Execution output port names in declaration order
    pub fn exec_outputs(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|p| p.data_type.is_execution())
            .map(|p| p.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        assert!(PortDataType::String.is_compatible_with(&PortDataType::String));
        assert!(PortDataType::Any.is_compatible_with(&PortDataType::Integer));
        assert!(PortDataType::Binary.is_compatible_with(&PortDataType::Any));
        assert!(!PortDataType::Integer.is_compatible_with(&PortDataType::Float));
        assert!(PortDataType::Execution.is_compatible_with(&PortDataType::Execution));
        assert!(!PortDataType::Execution.is_compatible_with(&PortDataType::Any));
        assert!(!PortDataType::Any.is_compatible_with(&PortDataType::Execution));
    }

    #[test]
    fn test_exec_outputs_order() {
        let ports = NodePorts::new(
            vec![],
            vec![
                PortDefinition::execution("true"),
                PortDefinition::optional("value", PortDataType::Any),
                PortDefinition::execution("false"),
            ],
        );
        assert_eq!(ports.exec_outputs(), vec!["true", "false"]);
    }
}
