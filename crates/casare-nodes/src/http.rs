//! HTTP request node backed by the engine's pooled HTTP sessions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use casare_engine::{
    Node, NodeContext, NodeFactory, NodeMetadata, NodeResult, ResourceKind, Result,
};
use casare_workflow::{PortDataType, PortDefinition, Value};

/// Performs one HTTP call.
///
/// Config: `url` (template), `method` (default GET), `body` (optional).
/// The node declares the `Http` resource, so the dispatcher hands it a
/// pooled session for the duration of each attempt.
pub struct HttpRequestNode;

#[async_trait]
impl Node for HttpRequestNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("url", PortDataType::String),
            PortDefinition::optional("method", PortDataType::String)
                .with_default(serde_json::json!("GET")),
            PortDefinition::optional("body", PortDataType::String),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::optional("status", PortDataType::Integer),
            PortDefinition::optional("body", PortDataType::String),
        ]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let url = match ctx.param_str("url") {
            Ok(url) if !url.is_empty() => url,
            _ => return NodeResult::fail("MissingParameter", "url is required", false),
        };
        let method = ctx
            .param_str("method")
            .unwrap_or_else(|_| "GET".to_string())
            .to_uppercase();
        let body = ctx.get_parameter_opt("body");

        let session = match ctx.http() {
            Ok(session) => session,
            Err(e) => return NodeResult::fail("Internal", e.to_string(), false),
        };

        let mut request = match method.as_str() {
            "GET" => session.client.get(&url),
            "POST" => session.client.post(&url),
            "PUT" => session.client.put(&url),
            "DELETE" => session.client.delete(&url),
            "PATCH" => session.client.patch(&url),
            "HEAD" => session.client.head(&url),
            other => {
                return NodeResult::fail(
                    "InvalidParameter",
                    format!("unsupported method '{}'", other),
                    false,
                )
            }
        };
        if let Some(body) = body {
            request = request.body(body.render());
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Connection-level failures are worth retrying
            Err(e) => return NodeResult::fail("HttpError", e.to_string(), true),
        };

        let status = response.status().as_u16() as i64;
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return NodeResult::fail("HttpError", e.to_string(), true),
        };

        log::debug!("http {} {} -> {}", method, url, status);
        NodeResult::ok()
            .with_output("status", Value::Int(status))
            .with_output("body", Value::Str(text))
    }
}

pub struct HttpRequestFactory;

impl NodeFactory for HttpRequestFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("http-request", "HTTP Request")
            .with_description("Perform an HTTP call through a pooled session")
            .with_input(PortDefinition::required("url", PortDataType::String))
            .with_input(
                PortDefinition::optional("method", PortDataType::String)
                    .with_default(serde_json::json!("GET")),
            )
            .with_input(PortDefinition::optional("body", PortDataType::String))
            .with_output(PortDefinition::optional("status", PortDataType::Integer))
            .with_output(PortDefinition::optional("body", PortDataType::String))
            .with_resource(ResourceKind::Http)
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(HttpRequestNode))
    }
}
