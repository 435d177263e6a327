//! The contract every action node implements
//!
//! Nodes are graph-agnostic: they receive a [`NodeContext`], read
//! parameters, do their work and return a [`NodeResult`]. They never pick
//! successor nodes by id; they select execution *output ports* by name and
//! the scheduler follows the edges.

use std::collections::HashMap;

use async_trait::async_trait;

use casare_workflow::{PortDefinition, PortName, Value};

use crate::context::NodeContext;

/// Control-flow signals a node may emit instead of completing.
///
/// The control-flow engine intercepts these; they never unwind across
/// node boundaries as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// Leave the innermost loop
    Break,
    /// Skip to the next iteration of the innermost loop
    Continue,
    /// Raise an error to the innermost try frame
    Throw { kind: String, message: String },
}

/// What a node invocation produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult {
    /// Successful completion. `next_execs` selects which execution output
    /// ports fire; for plain action nodes this is the single default
    /// output.
    Ok {
        outputs: HashMap<PortName, Value>,
        next_execs: Vec<PortName>,
    },
    /// The node failed; the retry wrapper decides what happens next
    Fail {
        kind: String,
        message: String,
        retryable: bool,
    },
    /// A control signal for the engine
    Signal(ControlSignal),
}

impl NodeResult {
    /// Success with no outputs, firing the default execution output
    pub fn ok() -> Self {
        Self::Ok {
            outputs: HashMap::new(),
            next_execs: vec!["exec_out".to_string()],
        }
    }

    /// Success firing the given execution outputs
    pub fn next(ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Ok {
            outputs: HashMap::new(),
            next_execs: ports.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a data output (builder style)
    pub fn with_output(mut self, port: impl Into<String>, value: Value) -> Self {
        if let Self::Ok { outputs, .. } = &mut self {
            outputs.insert(port.into(), value);
        }
        self
    }

    /// A failure result
    pub fn fail(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Fail {
            kind: kind.into(),
            message: message.into(),
            retryable,
        }
    }
}

/// An executable action node.
///
/// Implementations are created per workflow run by their
/// [`NodeFactory`](crate::registry::NodeFactory) from the node's design-time
/// config and must be safe to call from any worker task.
#[async_trait]
pub trait Node: Send + Sync {
    /// Data input ports in declaration order
    fn input_ports(&self) -> Vec<PortDefinition>;

    /// Data output ports in declaration order
    fn output_ports(&self) -> Vec<PortDefinition>;

    /// Run the node. Long operations must poll
    /// [`NodeContext::cancellation_token`] at their suspension points.
    async fn execute(&self, ctx: &NodeContext) -> NodeResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_builders() {
        let result = NodeResult::ok().with_output("value", Value::Int(3));
        match result {
            NodeResult::Ok {
                outputs,
                next_execs,
            } => {
                assert_eq!(outputs.get("value"), Some(&Value::Int(3)));
                assert_eq!(next_execs, vec!["exec_out"]);
            }
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn test_next_ports() {
        let result = NodeResult::next(["true"]);
        assert!(matches!(
            result,
            NodeResult::Ok { next_execs, .. } if next_execs == vec!["true"]
        ));
    }
}
