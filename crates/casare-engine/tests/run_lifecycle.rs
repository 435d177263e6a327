//! Run lifecycle behavior: parallelism, pause/resume, cancellation,
//! breaker integration and failure kinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use casare_engine::{
    BreakerConfig, Engine, EngineConfig, ExecutionEvent, Node, NodeContext, NodeFactory,
    NodeMetadata, NodeRegistry, NodeResult, Result, RunState,
};
use casare_workflow::{Connection, NodeRecord, PortDataType, PortDefinition, Workflow};

struct SleepNode;

#[async_trait]
impl Node for SleepNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::optional("duration_ms", PortDataType::Integer)
            .with_default(serde_json::json!(100))]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let ms = ctx.param_int("duration_ms").unwrap_or(100).max(0) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => NodeResult::ok(),
            _ = ctx.cancellation_token().cancelled() => {
                NodeResult::fail("Cancelled", "interrupted", false)
            }
        }
    }
}

struct SleepFactory;

impl NodeFactory for SleepFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("sleep", "Sleep").with_input(
            PortDefinition::optional("duration_ms", PortDataType::Integer)
                .with_default(serde_json::json!(100)),
        )
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(SleepNode))
    }
}

/// Fails every attempt with a retryable error
struct AlwaysFailNode {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Node for AlwaysFailNode {
    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![]
    }

    async fn execute(&self, _ctx: &NodeContext) -> NodeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        NodeResult::fail("Network", "connection refused", true)
    }
}

struct AlwaysFailFactory {
    calls: Arc<AtomicU32>,
}

impl NodeFactory for AlwaysFailFactory {
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("always-fail", "Always Fail")
    }

    fn create(&self, _config: &HashMap<String, serde_json::Value>) -> Result<Arc<dyn Node>> {
        Ok(Arc::new(AlwaysFailNode {
            calls: Arc::clone(&self.calls),
        }))
    }
}

fn registry_with_sleep() -> NodeRegistry {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(SleepFactory));
    registry
}

fn two_branch_workflow(ms: u64) -> Arc<Workflow> {
    Arc::new(
        Workflow::new("wf-parallel", "Parallel")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("a", "sleep").with_config("duration_ms", serde_json::json!(ms)),
            )
            .with_node(
                NodeRecord::new("b", "sleep").with_config("duration_ms", serde_json::json!(ms)),
            )
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "a", "exec_in"))
            .with_connection(Connection::new("start", "exec_out", "b", "exec_in"))
            .with_connection(Connection::new("a", "exec_out", "end", "exec_in"))
            .with_connection(Connection::new("b", "exec_out", "end", "exec_in")),
    )
}

#[tokio::test]
async fn independent_branches_run_concurrently() {
    let engine = Engine::new(registry_with_sleep());
    let started = Instant::now();
    let result = engine
        .run(two_branch_workflow(200))
        .unwrap()
        .wait()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.state, RunState::Completed);
    assert!(
        elapsed < Duration::from_millis(380),
        "branches ran sequentially: {:?}",
        elapsed
    );
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_releases() {
    let engine = Engine::new(registry_with_sleep());
    let workflow = Arc::new(
        Workflow::new("wf-cancel", "Cancel")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("slow", "sleep")
                    .with_config("duration_ms", serde_json::json!(5000)),
            )
            .with_node(
                NodeRecord::new("after", "sleep")
                    .with_config("duration_ms", serde_json::json!(10)),
            )
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "slow", "exec_in"))
            .with_connection(Connection::new("slow", "exec_out", "after", "exec_in"))
            .with_connection(Connection::new("after", "exec_out", "end", "exec_in")),
    );

    let handle = engine.run(workflow).unwrap();
    let mut rx = handle.event_receiver();
    let run_id = handle.run_id.clone();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel(&run_id).unwrap();

    let started_overall = Instant::now();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.state, RunState::Cancelled);
    assert!(
        started_overall.elapsed() < Duration::from_millis(1000),
        "cancel did not interrupt the sleeping node"
    );

    // No node may start after the cancel request
    let mut cancel_seen = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            ExecutionEvent::CancelRequested { .. } => cancel_seen = true,
            ExecutionEvent::NodeStarted { node_id, .. } => {
                assert!(!cancel_seen, "node '{}' started after cancel", node_id);
            }
            _ => {}
        }
    }
    assert!(cancel_seen);
}

#[tokio::test]
async fn pause_drains_dispatch_and_resume_continues() {
    let engine = Engine::new(registry_with_sleep());
    let workflow = Arc::new(
        Workflow::new("wf-pause", "Pause")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("first", "sleep")
                    .with_config("duration_ms", serde_json::json!(100)),
            )
            .with_node(
                NodeRecord::new("second", "sleep")
                    .with_config("duration_ms", serde_json::json!(10)),
            )
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "first", "exec_in"))
            .with_connection(Connection::new("first", "exec_out", "second", "exec_in"))
            .with_connection(Connection::new("second", "exec_out", "end", "exec_in")),
    );

    let handle = engine.run(workflow).unwrap();
    let run_id = handle.run_id.clone();

    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.pause(&run_id).unwrap();

    // The in-flight first node finishes; the second must not be dispatched
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.run_state(&run_id), Some(RunState::Paused));

    engine.resume(&run_id).unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.state, RunState::Completed);
}

#[tokio::test]
async fn breaker_opens_across_runs_of_one_engine() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(AlwaysFailFactory {
        calls: Arc::clone(&calls),
    }));

    let engine = Engine::builder(registry)
        .with_breaker_config(BreakerConfig {
            window: 4,
            failure_threshold: 0.5,
            min_calls: 4,
            cooldown: Duration::from_secs(60),
        })
        .build();

    let workflow = Arc::new(
        Workflow::new("wf-breaker", "Breaker")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("flaky", "always-fail"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "flaky", "exec_in"))
            .with_connection(Connection::new("flaky", "exec_out", "end", "exec_in")),
    );

    // Four failing runs feed the window and open the circuit
    for _ in 0..4 {
        let result = engine.run(Arc::clone(&workflow)).unwrap().wait().await.unwrap();
        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind(), "NodeError");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    // The next run is rejected without reaching the node
    let result = engine.run(workflow).unwrap().wait().await.unwrap();
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(result.error.as_ref().unwrap().kind(), "CircuitOpen");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn per_node_timeout_is_retryable_kind() {
    let engine = Engine::builder(registry_with_sleep())
        .with_config(EngineConfig::default().with_node_timeout(Duration::from_millis(50)))
        .build();

    let workflow = Arc::new(
        Workflow::new("wf-timeout", "Timeout")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("slow", "sleep")
                    .with_config("duration_ms", serde_json::json!(5000)),
            )
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "slow", "exec_in"))
            .with_connection(Connection::new("slow", "exec_out", "end", "exec_in")),
    );

    let result = engine.run(workflow).unwrap().wait().await.unwrap();
    assert_eq!(result.state, RunState::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind(), "Timeout");
    assert!(error.is_retryable());
}

#[tokio::test]
async fn undefined_variable_fails_the_run() {
    let engine = Engine::new(NodeRegistry::new());
    let workflow = Arc::new(
        Workflow::new("wf-ghost", "Ghost")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("cond", "If")
                    .with_config("condition", serde_json::json!("{{ghost}} > 1")),
            )
            .with_node(NodeRecord::new("yes", "End"))
            .with_node(NodeRecord::new("no", "End"))
            .with_connection(Connection::new("start", "exec_out", "cond", "exec_in"))
            .with_connection(Connection::new("cond", "true", "yes", "exec_in"))
            .with_connection(Connection::new("cond", "false", "no", "exec_in")),
    );

    let result = engine.run(workflow).unwrap().wait().await.unwrap();
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(result.error.unwrap().kind(), "UndefinedVariable");
}

#[tokio::test]
async fn validation_failure_surfaces_all_offenses() {
    let engine = Engine::new(NodeRegistry::new());
    let workflow = Arc::new(
        Workflow::new("wf-bad", "Bad")
            .with_node(NodeRecord::new("a", "End"))
            .with_node(NodeRecord::new("b", "mystery-type")),
    );
    let err = engine.run(workflow).unwrap_err();
    match err {
        casare_engine::EngineError::WorkflowValidation { offenses } => {
            assert!(offenses.len() >= 2, "expected several offenses: {:?}", offenses);
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
}
