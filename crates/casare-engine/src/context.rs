//! Per-run execution state and the facade nodes see
//!
//! `ExecutionContext` is created when a run starts and destroyed at its
//! terminal state; dropping it releases every reserved resource exactly
//! once. Nodes never touch it directly: each invocation gets a
//! [`NodeContext`] with its assembled parameters and an output buffer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use casare_workflow::{NodeId, PortName, Value, Workflow};

use crate::credentials::{CredentialHandle, CredentialStore};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, ExecutionEvent};
use crate::resources::{ReservedResource, RunResources};
use crate::variables::{ScopeKind, VariableStore};

/// Shared state for one workflow run
pub struct ExecutionContext {
    run_id: String,
    workflow: Arc<Workflow>,
    variables: RwLock<VariableStore>,
    /// Data outputs keyed by `(node, port)`; written once per node visit
    outputs: Mutex<HashMap<(NodeId, PortName), Value>>,
    resources: RunResources,
    reserved: Mutex<Vec<ReservedResource>>,
    cancel: CancellationToken,
    events: EventBus,
    credentials: Arc<dyn CredentialStore>,
    /// Sub-workflow nesting depth of this run (0 = top level)
    depth: usize,
    /// Bounds concurrent CPU-bound offloads
    blocking: Arc<Semaphore>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        workflow: Arc<Workflow>,
        resources: RunResources,
        events: EventBus,
        credentials: Arc<dyn CredentialStore>,
        cancel: CancellationToken,
        depth: usize,
        blocking_workers: usize,
    ) -> Self {
        let variables = VariableStore::from_definitions(&workflow.variables);
        Self {
            run_id: run_id.into(),
            workflow,
            variables: RwLock::new(variables),
            outputs: Mutex::new(HashMap::new()),
            resources,
            reserved: Mutex::new(Vec::new()),
            cancel,
            events,
            credentials,
            depth,
            blocking: Arc::new(Semaphore::new(blocking_workers.max(1))),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn resources(&self) -> &RunResources {
        &self.resources
    }

    // -- variables ----------------------------------------------------------

    /// Read a variable
    pub fn get_var(&self, name: &str) -> Result<Value> {
        self.variables.read().get(name)
    }

    /// Write a variable and publish `VariableChanged`
    pub fn set_var(&self, name: &str, value: Value) {
        let old = {
            let mut vars = self.variables.write();
            vars.set(name, value.clone())
        };
        self.events.publish(ExecutionEvent::VariableChanged {
            name: name.to_string(),
            old: old.map(|v| v.to_json()).unwrap_or(serde_json::Value::Null),
            new: value.to_json(),
        });
    }

    /// Declare a variable in the current scope frame (shadowing)
    pub fn declare_var(&self, name: &str, value: Value) {
        self.variables.write().declare(name, value);
    }

    /// Resolve a `{{placeholder}}` template against the variable store
    pub fn resolve(&self, template: &str) -> Result<Value> {
        self.variables.write().resolve(template)
    }

    pub fn push_scope(&self, kind: ScopeKind) {
        self.variables.write().push_scope(kind);
    }

    pub fn pop_scope(&self) {
        self.variables.write().pop_scope();
    }

    /// Every visible binding, for run results and sub-workflow extraction
    pub fn variables_snapshot(&self) -> HashMap<String, Value> {
        self.variables.read().snapshot()
    }

    // -- node outputs -------------------------------------------------------

    /// Record a node's data outputs (one write per port per visit)
    pub fn record_outputs(&self, node_id: &str, outputs: HashMap<PortName, Value>) {
        let mut map = self.outputs.lock();
        for (port, value) in outputs {
            map.insert((node_id.to_string(), port), value);
        }
    }

    /// Value currently assigned to a node's output port
    pub fn output(&self, node_id: &str, port: &str) -> Option<Value> {
        self.outputs
            .lock()
            .get(&(node_id.to_string(), port.to_string()))
            .cloned()
    }

    // -- resources & credentials -------------------------------------------

    /// Reserve one handle per kind for the whole run
    pub async fn reserve_resources(&self, kinds: &[crate::resources::ResourceKind]) -> Result<()> {
        let reserved = self.resources.reserve(kinds).await?;
        self.reserved.lock().extend(reserved);
        Ok(())
    }

    /// Release reserved handles. Idempotent; also runs on drop.
    pub fn release_reserved(&self) {
        self.reserved.lock().clear();
    }

    pub async fn credential(&self, alias: &str) -> Result<CredentialHandle> {
        self.credentials.lookup(alias).await
    }

    /// Take a slot on the CPU-bound worker budget.
    ///
    /// The dispatcher holds one of these for the whole execution of a
    /// node whose type is declared `cpu_bound`, so heavy nodes cannot
    /// saturate the runtime even when `max_parallel` is generous.
    pub async fn blocking_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.blocking)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::internal("blocking pool closed"))
    }

    /// Run a CPU-bound closure on the bounded blocking pool
    pub async fn offload<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = Arc::clone(&self.blocking)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::internal("blocking pool closed"))?;
        let result = tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| EngineError::internal(format!("blocking task panicked: {}", e)));
        drop(permit);
        result
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release_reserved();
    }
}

/// The view one node invocation gets.
///
/// Parameters are assembled by the scheduler before dispatch: connected
/// data inputs win over config values (with templates resolved), which win
/// over declared defaults. The node records outputs here or returns them
/// in its [`NodeResult`](crate::node::NodeResult); the engine merges both.
pub struct NodeContext {
    ctx: Arc<ExecutionContext>,
    node_id: NodeId,
    type_name: String,
    params: HashMap<String, Value>,
    outputs: Mutex<HashMap<PortName, Value>>,
    /// Resources acquired for the current attempt, installed by the
    /// dispatcher and released when the attempt ends
    held: Mutex<Vec<ReservedResource>>,
}

impl NodeContext {
    pub fn new(
        ctx: Arc<ExecutionContext>,
        node_id: impl Into<String>,
        type_name: impl Into<String>,
        params: HashMap<String, Value>,
    ) -> Self {
        Self {
            ctx,
            node_id: node_id.into(),
            type_name: type_name.into(),
            params,
            outputs: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        self.ctx.run_id()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The assembled value for an input, failing when absent
    pub fn get_parameter(&self, name: &str) -> Result<Value> {
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::node(
                "MissingParameter",
                format!("node '{}' has no parameter '{}'", self.node_id, name),
                false,
            ))
    }

    /// The assembled value for an input, if present and non-null
    pub fn get_parameter_opt(&self, name: &str) -> Option<Value> {
        match self.params.get(name) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        }
    }

    /// String view of a parameter
    pub fn param_str(&self, name: &str) -> Result<String> {
        Ok(self.get_parameter(name)?.render())
    }

    /// Integer view of a parameter, with scalar coercion
    pub fn param_int(&self, name: &str) -> Result<i64> {
        let value = self.get_parameter(name)?;
        value
            .coerce_to(casare_workflow::PortDataType::Integer)
            .and_then(|v| v.as_int())
            .ok_or_else(|| EngineError::TypeMismatch {
                port: name.to_string(),
                expected: "Integer".into(),
                actual: format!("{:?}", value.data_type()),
            })
    }

    /// Record a data output for fan-out to downstream nodes
    pub fn set_output(&self, port: impl Into<String>, value: Value) {
        self.outputs.lock().insert(port.into(), value);
    }

    /// Drain outputs recorded through [`set_output`](Self::set_output)
    pub fn take_outputs(&self) -> HashMap<PortName, Value> {
        std::mem::take(&mut *self.outputs.lock())
    }

    /// Install the guards acquired for one attempt
    pub fn install_guards(&self, guards: Vec<ReservedResource>) {
        *self.held.lock() = guards;
    }

    /// Release the current attempt's guards back to their pools
    pub fn clear_guards(&self) {
        self.held.lock().clear();
    }

    /// The browser acquired for this attempt (declared in node metadata)
    pub fn browser(&self) -> Result<Arc<crate::resources::BrowserSession>> {
        self.held
            .lock()
            .iter()
            .find_map(|r| match r {
                ReservedResource::Browser(guard) => Some(guard.share()),
                _ => None,
            })
            .ok_or_else(|| EngineError::internal("node did not declare a browser resource"))
    }

    /// The HTTP session acquired for this attempt
    pub fn http(&self) -> Result<Arc<crate::resources::HttpSession>> {
        self.held
            .lock()
            .iter()
            .find_map(|r| match r {
                ReservedResource::Http(guard) => Some(guard.share()),
                _ => None,
            })
            .ok_or_else(|| EngineError::internal("node did not declare an http resource"))
    }

    /// The database connection acquired for this attempt
    pub fn database(&self) -> Result<Arc<crate::resources::DbSession>> {
        self.held
            .lock()
            .iter()
            .find_map(|r| match r {
                ReservedResource::Database(guard) => Some(guard.share()),
                _ => None,
            })
            .ok_or_else(|| EngineError::internal("node did not declare a database resource"))
    }

    // Pass-throughs to the run context

    pub fn get_var(&self, name: &str) -> Result<Value> {
        self.ctx.get_var(name)
    }

    pub fn set_var(&self, name: &str, value: Value) {
        self.ctx.set_var(name, value);
    }

    pub fn resolve(&self, template: &str) -> Result<Value> {
        self.ctx.resolve(template)
    }

    pub fn resources(&self) -> &RunResources {
        self.ctx.resources()
    }

    pub async fn credential(&self, alias: &str) -> Result<CredentialHandle> {
        self.ctx.credential(alias).await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        self.ctx.cancellation_token()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        self.ctx.events().publish(event);
    }

    pub async fn offload<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.ctx.offload(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::NullCredentialStore;
    use crate::resources::{ResourceConfig, ResourceManager};

    fn test_context() -> Arc<ExecutionContext> {
        let workflow = Arc::new(Workflow::new("wf", "Test"));
        let manager = Arc::new(ResourceManager::new(ResourceConfig::default()));
        Arc::new(ExecutionContext::new(
            "run-1",
            workflow,
            RunResources::new(manager, None, false),
            EventBus::new(16),
            Arc::new(NullCredentialStore),
            CancellationToken::new(),
            0,
            4,
        ))
    }

    #[test]
    fn test_variable_change_event() {
        let ctx = test_context();
        let mut rx = ctx.events().subscribe();
        ctx.set_var("x", Value::Int(1));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ExecutionEvent::VariableChanged { name, .. } if name == "x"));
    }

    #[test]
    fn test_output_single_assignment_per_visit() {
        let ctx = test_context();
        let mut outputs = HashMap::new();
        outputs.insert("value".to_string(), Value::Int(7));
        ctx.record_outputs("n1", outputs);
        assert_eq!(ctx.output("n1", "value"), Some(Value::Int(7)));
        assert_eq!(ctx.output("n1", "other"), None);
    }

    #[test]
    fn test_node_context_parameters() {
        let ctx = test_context();
        let mut params = HashMap::new();
        params.insert("url".to_string(), Value::Str("https://example.org".into()));
        params.insert("count".to_string(), Value::Str("5".into()));
        let node_ctx = NodeContext::new(ctx, "n1", "http-request", params);

        assert_eq!(node_ctx.param_str("url").unwrap(), "https://example.org");
        assert_eq!(node_ctx.param_int("count").unwrap(), 5);
        assert!(node_ctx.get_parameter("missing").is_err());
        assert!(node_ctx.get_parameter_opt("missing").is_none());
    }

    #[tokio::test]
    async fn test_offload_runs_closure() {
        let ctx = test_context();
        let result = ctx.offload(|| 21 * 2).await.unwrap();
        assert_eq!(result, 42);
    }
}
