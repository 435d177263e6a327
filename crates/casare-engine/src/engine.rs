//! Engine facade
//!
//! One `Engine` owns the node registry, the shared resource pools, the
//! per-type circuit breakers and the plan cache. Runs are started with
//! [`Engine::run`] and controlled through their run id
//! (`pause`/`resume`/`cancel`) or the returned [`RunHandle`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use casare_workflow::Workflow;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::credentials::{CredentialStore, NullCredentialStore};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, ExecutionEvent};
use crate::executor::{drive_run, RunResult, RunState};
use crate::registry::NodeRegistry;
use crate::resources::{
    BrowserDriver, DatabaseConnector, ResourceConfig, ResourceManager, RunResources,
};
use crate::scheduler::{compile, ExecutionPlan};

/// Resolves sub-workflow references for `SubWorkflowCall` nodes
pub trait WorkflowResolver: Send + Sync {
    fn resolve(&self, workflow_id: &str) -> Option<Arc<Workflow>>;
}

/// Resolver used when no sub-workflows are configured
pub struct NoSubWorkflows;

impl WorkflowResolver for NoSubWorkflows {
    fn resolve(&self, _workflow_id: &str) -> Option<Arc<Workflow>> {
        None
    }
}

/// Simple map-backed resolver
#[derive(Default)]
pub struct InMemoryResolver {
    workflows: Mutex<HashMap<String, Arc<Workflow>>>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: Arc<Workflow>) {
        self.workflows
            .lock()
            .insert(workflow.id.clone(), workflow);
    }
}

impl WorkflowResolver for InMemoryResolver {
    fn resolve(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.lock().get(workflow_id).cloned()
    }
}

/// State shared between the engine facade and its run drivers
pub(crate) struct EngineInner {
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) breakers: Arc<BreakerRegistry>,
    pub(crate) resolver: Arc<dyn WorkflowResolver>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) config: EngineConfig,
    pub(crate) plans: Mutex<HashMap<u64, Arc<ExecutionPlan>>>,
}

/// Compile a workflow, reusing the engine's plan cache
pub(crate) fn compile_cached(
    inner: &Arc<EngineInner>,
    workflow: Arc<Workflow>,
) -> Result<Arc<ExecutionPlan>> {
    let hash = workflow.content_hash();
    if let Some(plan) = inner.plans.lock().get(&hash) {
        return Ok(Arc::clone(plan));
    }
    let plan = compile(workflow, &inner.registry)?;
    inner.plans.lock().insert(hash, Arc::clone(&plan));
    Ok(plan)
}

struct RunControls {
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    events: EventBus,
    state_rx: watch::Receiver<RunState>,
}

/// Handle to a started run
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    events: EventBus,
    state_rx: watch::Receiver<RunState>,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    /// Await the run's terminal result
    pub async fn wait(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| EngineError::internal(format!("run task failed: {}", e)))
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        *self.state_rx.borrow()
    }

    /// Subscribe to the run's event stream
    pub fn subscribe_events(&self) -> BroadcastStream<ExecutionEvent> {
        self.events.stream()
    }

    /// Raw broadcast receiver, for tests that want `recv()`
    pub fn event_receiver(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }
}

/// Builds an [`Engine`] with non-default collaborators
pub struct EngineBuilder {
    registry: NodeRegistry,
    config: EngineConfig,
    resource_config: ResourceConfig,
    breaker_config: BreakerConfig,
    resolver: Arc<dyn WorkflowResolver>,
    credentials: Arc<dyn CredentialStore>,
    browser_driver: Option<Arc<dyn BrowserDriver>>,
    db_connector: Option<Arc<dyn DatabaseConnector>>,
}

impl EngineBuilder {
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
            resource_config: ResourceConfig::default(),
            breaker_config: BreakerConfig::default(),
            resolver: Arc::new(NoSubWorkflows),
            credentials: Arc::new(NullCredentialStore),
            browser_driver: None,
            db_connector: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_resource_config(mut self, config: ResourceConfig) -> Self {
        self.resource_config = config;
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn WorkflowResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.browser_driver = Some(driver);
        self
    }

    pub fn with_db_connector(mut self, connector: Arc<dyn DatabaseConnector>) -> Self {
        self.db_connector = Some(connector);
        self
    }

    pub fn build(self) -> Engine {
        let resources = ResourceManager::with_drivers(
            self.resource_config,
            self.browser_driver
                .unwrap_or_else(|| Arc::new(UnusableBrowser)),
            self.db_connector.unwrap_or_else(|| Arc::new(UnusableDb)),
        );
        Engine {
            inner: Arc::new(EngineInner {
                registry: Arc::new(self.registry),
                resources: Arc::new(resources),
                breakers: Arc::new(BreakerRegistry::new(self.breaker_config)),
                resolver: self.resolver,
                credentials: self.credentials,
                config: self.config,
                plans: Mutex::new(HashMap::new()),
            }),
            runs: Mutex::new(HashMap::new()),
        }
    }
}

struct UnusableBrowser;

#[async_trait::async_trait]
impl BrowserDriver for UnusableBrowser {
    async fn launch(&self) -> Result<crate::resources::BrowserSession> {
        Err(EngineError::ResourceExhausted {
            what: "no browser driver configured".into(),
        })
    }
}

struct UnusableDb;

#[async_trait::async_trait]
impl DatabaseConnector for UnusableDb {
    async fn connect(&self, target: &str) -> Result<crate::resources::DbSession> {
        Err(EngineError::ResourceExhausted {
            what: format!("no database connector configured for '{}'", target),
        })
    }
}

/// The workflow execution engine
pub struct Engine {
    inner: Arc<EngineInner>,
    runs: Mutex<HashMap<String, RunControls>>,
}

impl Engine {
    /// Engine with default limits and no external collaborators
    pub fn new(registry: NodeRegistry) -> Self {
        EngineBuilder::new(registry).build()
    }

    pub fn builder(registry: NodeRegistry) -> EngineBuilder {
        EngineBuilder::new(registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a workflow run.
    ///
    /// Compilation is cached by workflow content hash. The run executes on
    /// the current tokio runtime; the returned handle resolves to its
    /// terminal [`RunResult`].
    pub fn run(&self, workflow: Arc<Workflow>) -> Result<RunHandle> {
        self.prune_finished();

        let plan = compile_cached(&self.inner, workflow)?;
        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let events = EventBus::new(self.inner.config.event_capacity);
        let (pause_tx, pause_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RunState::Pending);

        let ctx = Arc::new(ExecutionContext::new(
            run_id.clone(),
            Arc::clone(&plan.workflow),
            RunResources::new(
                Arc::clone(&self.inner.resources),
                self.inner.config.resource_quota,
                self.inner.config.quota_fail_fast,
            ),
            events.clone(),
            Arc::clone(&self.inner.credentials),
            cancel.clone(),
            0,
            self.inner.config.blocking_workers,
        ));

        self.runs.lock().insert(
            run_id.clone(),
            RunControls {
                pause_tx,
                cancel,
                events: events.clone(),
                state_rx: state_rx.clone(),
            },
        );

        log::info!("starting run {} of workflow '{}'", run_id, plan.workflow.id);
        let join = tokio::spawn(drive_run(
            Arc::clone(&self.inner),
            plan,
            ctx,
            pause_rx,
            state_tx,
        ));

        Ok(RunHandle {
            run_id,
            events,
            state_rx,
            join,
        })
    }

    /// Request a pause: dispatch stops at the next node boundary,
    /// in-flight nodes finish
    pub fn pause(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock();
        let controls = runs
            .get(run_id)
            .ok_or_else(|| EngineError::internal(format!("unknown run '{}'", run_id)))?;
        controls.events.publish(ExecutionEvent::PauseRequested {
            run_id: run_id.to_string(),
        });
        let _ = controls.pause_tx.send(true);
        Ok(())
    }

    /// Resume a paused run
    pub fn resume(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock();
        let controls = runs
            .get(run_id)
            .ok_or_else(|| EngineError::internal(format!("unknown run '{}'", run_id)))?;
        controls.events.publish(ExecutionEvent::ResumeRequested {
            run_id: run_id.to_string(),
        });
        let _ = controls.pause_tx.send(false);
        Ok(())
    }

    /// Cancel a run. Queued work is flushed; in-flight nodes observe the
    /// token cooperatively; resources are released at teardown.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock();
        let controls = runs
            .get(run_id)
            .ok_or_else(|| EngineError::internal(format!("unknown run '{}'", run_id)))?;
        controls.events.publish(ExecutionEvent::CancelRequested {
            run_id: run_id.to_string(),
        });
        controls.cancel.cancel();
        Ok(())
    }

    /// Subscribe to a run's event stream by id
    pub fn subscribe_events(&self, run_id: &str) -> Result<BroadcastStream<ExecutionEvent>> {
        let runs = self.runs.lock();
        let controls = runs
            .get(run_id)
            .ok_or_else(|| EngineError::internal(format!("unknown run '{}'", run_id)))?;
        Ok(controls.events.stream())
    }

    /// Current state of a tracked run
    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        self.runs.lock().get(run_id).map(|c| *c.state_rx.borrow())
    }

    /// Drop controls of finished runs
    fn prune_finished(&self) {
        self.runs
            .lock()
            .retain(|_, controls| !controls.state_rx.borrow().is_terminal());
    }
}
