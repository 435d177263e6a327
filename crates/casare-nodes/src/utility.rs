//! Small utility nodes: no-op, delay, logging

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use casare_engine::{Node, NodeContext, NodeFactory, NodeMetadata, NodeResult, Result};
use casare_workflow::{PortDataType, PortDefinition};

/// Passes execution through without side effects
pub struct NoOpNode;

#[async_trait]
impl Node for NoOpNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, _ctx: &NodeContext) -> NodeResult {
        NodeResult::ok()
    }
}

pub struct NoOpFactory;

impl NodeFactory for NoOpFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("no-op", "No-op").with_description("Do nothing")
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(NoOpNode))
    }
}

/// Sleeps for `duration_ms`, waking early on cancellation
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("duration_ms", PortDataType::Integer)
            .with_default(serde_json::json!(1000))]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let millis = match ctx.param_int("duration_ms") {
            Ok(ms) => ms.max(0) as u64,
            Err(e) => return NodeResult::fail("TypeMismatch", e.to_string(), false),
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => NodeResult::ok(),
            _ = ctx.cancellation_token().cancelled() => {
                NodeResult::fail("Cancelled", "delay interrupted", false)
            }
        }
    }
}

pub struct DelayFactory;

impl NodeFactory for DelayFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("delay", "Delay")
            .with_description("Wait a fixed amount of time")
            .with_input(
                PortDefinition::optional("duration_ms", PortDataType::Integer)
                    .with_default(serde_json::json!(1000)),
            )
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(DelayNode))
    }
}

/// Writes a message to the engine log.
///
/// Config: `message` (template), `level` (`trace`..`error`, default info).
pub struct LogMessageNode;

#[async_trait]
impl Node for LogMessageNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("message", PortDataType::String)]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let message = ctx.param_str("message").unwrap_or_default();
        let level = ctx.param_str("level").unwrap_or_else(|_| "info".to_string());
        match level.as_str() {
            "trace" => log::trace!("[{}] {}", ctx.node_id(), message),
            "debug" => log::debug!("[{}] {}", ctx.node_id(), message),
            "warn" => log::warn!("[{}] {}", ctx.node_id(), message),
            "error" => log::error!("[{}] {}", ctx.node_id(), message),
            _ => log::info!("[{}] {}", ctx.node_id(), message),
        }
        NodeResult::ok()
    }
}

pub struct LogMessageFactory;

impl NodeFactory for LogMessageFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("log-message", "Log Message")
            .with_description("Write a message to the engine log")
            .with_input(PortDefinition::optional("message", PortDataType::String))
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(LogMessageNode))
    }
}
