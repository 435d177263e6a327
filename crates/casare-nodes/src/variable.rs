//! Variable manipulation nodes

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use casare_engine::{
    EngineError, Node, NodeContext, NodeFactory, NodeMetadata, NodeResult, Result,
};
use casare_workflow::{PortDataType, PortDefinition, Value};

/// Writes a value into a variable.
///
/// Config: `name` (identifier), `value` (any; templates are resolved
/// before execution).
pub struct SetVariableNode;

#[async_trait]
impl Node for SetVariableNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("value", PortDataType::Any)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let name = match ctx.param_str("name") {
            Ok(name) => name,
            Err(e) => return NodeResult::fail("MissingParameter", e.to_string(), false),
        };
        let value = ctx.get_parameter_opt("value").unwrap_or(Value::Null);
        ctx.set_var(&name, value);
        NodeResult::ok()
    }
}

pub struct SetVariableFactory;

impl NodeFactory for SetVariableFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("set-variable", "Set Variable")
            .with_description("Write a value into a workflow variable")
            .with_input(PortDefinition::optional("value", PortDataType::Any))
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(SetVariableNode))
    }
}

/// Appends a value to a list variable, creating the list when the
/// variable is not yet bound.
///
/// Config: `list` (variable name), `value`.
pub struct AppendToListNode;

#[async_trait]
impl Node for AppendToListNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("value", PortDataType::Any)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("list", PortDataType::List)]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let name = match ctx.param_str("list") {
            Ok(name) => name,
            Err(e) => return NodeResult::fail("MissingParameter", e.to_string(), false),
        };
        let value = ctx.get_parameter_opt("value").unwrap_or(Value::Null);

        let mut items = match ctx.get_var(&name) {
            Ok(Value::List(items)) => items,
            Ok(Value::Null) | Err(EngineError::UndefinedVariable { .. }) => Vec::new(),
            Ok(other) => {
                return NodeResult::fail(
                    "TypeMismatch",
                    format!("variable '{}' is {:?}, not a list", name, other.data_type()),
                    false,
                )
            }
            Err(e) => return NodeResult::fail("Internal", e.to_string(), false),
        };
        items.push(value);
        let list = Value::List(items);
        ctx.set_var(&name, list.clone());
        NodeResult::ok().with_output("list", list)
    }
}

pub struct AppendToListFactory;

impl NodeFactory for AppendToListFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("append-to-list", "Append To List")
            .with_description("Append a value to a list variable")
            .with_input(PortDefinition::optional("value", PortDataType::Any))
            .with_output(PortDefinition::optional("list", PortDataType::List))
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(AppendToListNode))
    }
}
