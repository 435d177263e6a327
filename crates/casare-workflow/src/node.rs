//! Node records and the core node kinds the engine interprets itself

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodePorts, PortDataType, PortDefinition};

/// A node instance in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Unique identifier within the workflow
    pub id: NodeId,
    /// Dispatch key into the node registry (or a core kind name)
    #[serde(alias = "type_name")]
    pub type_name: String,
    /// Design-time property values, keyed by property name
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Position in the visual editor; opaque to the engine
    #[serde(default)]
    pub position: (f64, f64),
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            config: HashMap::new(),
            position: (0.0, 0.0),
        }
    }

    /// Set a config property (builder style)
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// The core kind of this node
    pub fn kind(&self) -> CoreNodeKind {
        CoreNodeKind::from_type_name(&self.type_name)
    }

    /// Read a string config property
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

/// Node kinds whose semantics are implemented by the engine itself.
///
/// Any `type_name` not listed here is an opaque action dispatched through
/// the node registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreNodeKind {
    Start,
    End,
    Comment,
    Reroute,
    If,
    Switch,
    Merge,
    ForLoopStart,
    ForLoopEnd,
    WhileLoopStart,
    WhileLoopEnd,
    Break,
    Continue,
    Try,
    Catch,
    Finally,
    Retry,
    ThrowError,
    SubWorkflowCall,
    /// Opaque action node resolved through the registry
    Action,
}

impl CoreNodeKind {
    /// Classify a `type_name`
    pub fn from_type_name(type_name: &str) -> Self {
        match type_name {
            "Start" => Self::Start,
            "End" => Self::End,
            "Comment" => Self::Comment,
            "Reroute" => Self::Reroute,
            "If" => Self::If,
            "Switch" => Self::Switch,
            "Merge" => Self::Merge,
            "ForLoopStart" => Self::ForLoopStart,
            "ForLoopEnd" => Self::ForLoopEnd,
            "WhileLoopStart" => Self::WhileLoopStart,
            "WhileLoopEnd" => Self::WhileLoopEnd,
            "Break" => Self::Break,
            "Continue" => Self::Continue,
            "Try" => Self::Try,
            "Catch" => Self::Catch,
            "Finally" => Self::Finally,
            "Retry" => Self::Retry,
            "ThrowError" => Self::ThrowError,
            "SubWorkflowCall" => Self::SubWorkflowCall,
            _ => Self::Action,
        }
    }

    /// Whether the engine interprets this kind instead of the registry
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Action | Self::Comment | Self::Reroute)
    }

    /// Whether this kind forwards execution without doing anything
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Comment | Self::Reroute)
    }

    /// Whether this kind may fan out over several execution outputs
    pub fn is_branching(&self) -> bool {
        matches!(
            self,
            Self::Start
                | Self::If
                | Self::Switch
                | Self::ForLoopStart
                | Self::WhileLoopStart
                | Self::Try
        )
    }

    /// Derive the port set for a control kind from its config.
    ///
    /// Returns `None` for `Action`: action ports come from the registry.
    pub fn derive_ports(&self, config: &HashMap<String, serde_json::Value>) -> Option<NodePorts> {
        use PortDefinition as P;
        let exec_in = || P::execution("exec_in");
        let exec_out = || P::execution("exec_out");
        let ports = match self {
            Self::Action => return None,
            Self::Start => NodePorts::new(vec![], vec![exec_out()]),
            Self::End => NodePorts::new(vec![exec_in()], vec![]),
            Self::Comment => NodePorts::new(vec![], vec![]),
            Self::Reroute => NodePorts::new(
                vec![exec_in(), P::optional("value", PortDataType::Any)],
                vec![exec_out(), P::optional("value", PortDataType::Any)],
            ),
            Self::If => NodePorts::new(
                vec![exec_in()],
                vec![P::execution("true"), P::execution("false")],
            ),
            Self::Switch => {
                let mut outputs: Vec<PortDefinition> = config
                    .get("cases")
                    .and_then(|v| v.as_array())
                    .map(|cases| {
                        cases
                            .iter()
                            .filter_map(|c| c.as_str())
                            .map(P::execution)
                            .collect()
                    })
                    .unwrap_or_default();
                outputs.push(P::execution("default"));
                NodePorts::new(vec![exec_in()], outputs)
            }
            Self::Merge => NodePorts::new(vec![exec_in()], vec![exec_out()]),
            Self::ForLoopStart | Self::WhileLoopStart => NodePorts::new(
                vec![exec_in(), P::execution("loop")],
                vec![P::execution("body"), P::execution("completed")],
            ),
            Self::ForLoopEnd | Self::WhileLoopEnd => {
                NodePorts::new(vec![exec_in()], vec![P::execution("loop")])
            }
            Self::Break | Self::Continue => NodePorts::new(vec![exec_in()], vec![]),
            Self::Try => NodePorts::new(
                vec![exec_in()],
                vec![
                    P::execution("body"),
                    P::execution("catch"),
                    P::execution("finally"),
                ],
            ),
            Self::Catch | Self::Finally => NodePorts::new(vec![exec_in()], vec![exec_out()]),
            Self::Retry => NodePorts::new(vec![exec_in()], vec![P::execution("body")]),
            Self::ThrowError => NodePorts::new(vec![exec_in()], vec![]),
            Self::SubWorkflowCall => NodePorts::new(vec![exec_in()], vec![exec_out()]),
        };
        Some(ports)
    }
}

/// Source of port definitions for a node record.
///
/// Control kinds derive their ports statically; action nodes resolve them
/// through the engine's node registry, which implements this trait.
pub trait PortCatalog {
    /// Port set for the node, or `None` when the type is unknown
    fn ports(&self, node: &NodeRecord) -> Option<NodePorts>;
}

/// Catalog that only knows the core control kinds.
///
/// Useful for validating pure control-flow workflows in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreCatalog;

impl PortCatalog for CoreCatalog {
    fn ports(&self, node: &NodeRecord) -> Option<NodePorts> {
        node.kind().derive_ports(&node.config)
    }
}
