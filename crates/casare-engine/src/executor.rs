//! The run driver
//!
//! One driver task owns one run: it holds the token queue, the control
//! frame stack and the in-flight `JoinSet`. Control nodes are interpreted
//! inline; opaque nodes are spawned as tasks wrapped in retry, circuit
//! breaker and timeout. Data values land in the context's output map and
//! are assembled into downstream parameter maps at dispatch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use casare_workflow::{CoreNodeKind, NodeId, Value, Workflow};

use crate::context::{ExecutionContext, NodeContext};
use crate::control::{
    eval_condition, switch_port, Frame, LoopFrame, LoopSource, RetryFrame, TryFrame, TryState,
};
use crate::engine::{compile_cached, EngineInner};
use crate::error::{EngineError, Result};
use crate::events::{ExecutionEvent, RunSummary};
use crate::node::{ControlSignal, Node, NodeResult};
use crate::resources::{ReservedResource, ResourceKind, RunResources};
use crate::retry::run_with_retry;
use crate::scheduler::{ExecutionPlan, NodeClass, NodePlan};
use crate::variables::ScopeKind;

/// Lifecycle state of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Final outcome of a run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub state: RunState,
    /// Primary cause when the state is `Failed` or `Cancelled`
    pub error: Option<EngineError>,
    /// Variable snapshot at the terminal state. For cancelled runs this
    /// includes the effects of branches that completed before the cancel.
    pub variables: HashMap<String, Value>,
    pub summary: RunSummary,
}

/// A token of control arriving at a node
#[derive(Debug, Clone)]
struct Token {
    node: NodeId,
    /// Control-frame stack depth when enqueued
    frame_depth: usize,
    /// Unwind epoch when enqueued
    epoch: u64,
}

/// Record of one unwind (break/continue/catch) used to discard stale
/// in-flight results
#[derive(Debug, Clone, Copy)]
struct Unwind {
    epoch: u64,
    depth: usize,
}

/// What a spawned node task hands back to the driver
struct TaskOutcome {
    token: Token,
    type_name: String,
    started: Instant,
    result: Result<NodeResult>,
    /// Outputs recorded through `NodeContext::set_output`
    buffered_outputs: HashMap<String, Value>,
}

enum LoopStep {
    Body {
        item: Option<Value>,
        index: u64,
        item_var: String,
        index_var: String,
    },
    Exit,
    Fail(EngineError),
}

pub(crate) struct RunDriver {
    inner: Arc<EngineInner>,
    plan: Arc<ExecutionPlan>,
    ctx: Arc<ExecutionContext>,
    frames: Vec<Frame>,
    queue: VecDeque<Token>,
    inflight: JoinSet<TaskOutcome>,
    instances: HashMap<NodeId, Arc<dyn Node>>,
    pause_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<RunState>,
    max_parallel: usize,
    completed: u64,
    failed: u64,
    retried: Arc<AtomicU64>,
    epoch: u64,
    unwinds: Vec<Unwind>,
}

/// Execute a compiled plan to its terminal state
pub(crate) async fn drive_run(
    inner: Arc<EngineInner>,
    plan: Arc<ExecutionPlan>,
    ctx: Arc<ExecutionContext>,
    pause_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<RunState>,
) -> RunResult {
    let max_parallel = if plan.uses_browser() {
        inner
            .config
            .max_parallel
            .min(inner.resources.config().browser_max.max(1))
    } else {
        inner.config.max_parallel
    };

    let driver = RunDriver {
        inner,
        plan,
        ctx,
        frames: Vec::new(),
        queue: VecDeque::new(),
        inflight: JoinSet::new(),
        instances: HashMap::new(),
        pause_rx,
        state_tx,
        max_parallel,
        completed: 0,
        failed: 0,
        retried: Arc::new(AtomicU64::new(0)),
        epoch: 0,
        unwinds: Vec::new(),
    };
    driver.run().await
}

impl RunDriver {
    async fn run(mut self) -> RunResult {
        let started = Instant::now();
        let run_id = self.ctx.run_id().to_string();
        let _ = self.state_tx.send(RunState::Running);
        self.ctx.events().publish(ExecutionEvent::WorkflowStarted {
            run_id: run_id.clone(),
            workflow_id: self.ctx.workflow().id.clone(),
            start_time: Utc::now(),
        });

        let reserved_kinds = self.plan.reserved_kinds.clone();
        let start_node = self.plan.start.clone();
        let outcome = match self.ctx.reserve_resources(&reserved_kinds).await {
            Ok(()) => {
                self.enqueue(&start_node);
                self.drive().await
            }
            Err(error) => Err(error),
        };

        // Terminal: drain whatever is still in flight, then release
        self.queue.clear();
        while self.inflight.join_next().await.is_some() {}
        self.ctx.release_reserved();

        let summary = RunSummary {
            completed: self.completed,
            failed: self.failed,
            retried: self.retried.load(Ordering::Relaxed),
        };
        let variables = self.ctx.variables_snapshot();
        let duration_ms = started.elapsed().as_millis() as u64;

        let (state, error) = match outcome {
            Ok(()) => {
                self.ctx.events().publish(ExecutionEvent::WorkflowCompleted {
                    run_id: run_id.clone(),
                    duration_ms,
                    summary: summary.clone(),
                });
                (RunState::Completed, None)
            }
            Err(EngineError::Cancelled) => {
                self.ctx.events().publish(ExecutionEvent::WorkflowFailed {
                    run_id: run_id.clone(),
                    error_kind: EngineError::Cancelled.kind().to_string(),
                    message: EngineError::Cancelled.to_string(),
                });
                (RunState::Cancelled, Some(EngineError::Cancelled))
            }
            Err(error) => {
                self.ctx.events().publish(ExecutionEvent::WorkflowFailed {
                    run_id: run_id.clone(),
                    error_kind: error.kind().to_string(),
                    message: error.to_string(),
                });
                (RunState::Failed, Some(error))
            }
        };
        let _ = self.state_tx.send(state);
        log::info!("run {} finished {:?} in {}ms", run_id, state, duration_ms);

        RunResult {
            run_id,
            state,
            error,
            variables,
            summary,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let cancel = self.ctx.cancellation_token().clone();
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let paused = *self.pause_rx.borrow();
            if !paused {
                while self.inflight.len() < self.max_parallel {
                    let Some(token) = self.queue.pop_front() else {
                        break;
                    };
                    self.dispatch(token)?;
                }
            }

            if self.inflight.is_empty() {
                self.unwinds.clear();
                if self.queue.is_empty() {
                    return Ok(());
                }
            }

            enum Wake {
                Cancelled,
                PauseChanged(bool),
                Joined(Option<std::result::Result<TaskOutcome, tokio::task::JoinError>>),
            }

            let wake = {
                let pause_rx = &mut self.pause_rx;
                let inflight = &mut self.inflight;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    changed = pause_rx.changed() => Wake::PauseChanged(changed.is_ok()),
                    joined = inflight.join_next(), if !inflight.is_empty() => {
                        Wake::Joined(joined)
                    }
                }
            };

            match wake {
                Wake::Cancelled => return Err(EngineError::Cancelled),
                // The controlling side went away; treat the run as orphaned
                Wake::PauseChanged(false) => return Err(EngineError::Cancelled),
                Wake::PauseChanged(true) => {
                    let paused = *self.pause_rx.borrow();
                    let _ = self.state_tx.send(if paused {
                        RunState::Paused
                    } else {
                        RunState::Running
                    });
                }
                Wake::Joined(Some(Ok(outcome))) => self.handle_outcome(outcome)?,
                Wake::Joined(Some(Err(join_error))) => {
                    return Err(EngineError::internal(format!(
                        "node task panicked: {}",
                        join_error
                    )));
                }
                Wake::Joined(None) => {}
            }
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn dispatch(&mut self, token: Token) -> Result<()> {
        let plan_node = self.plan.node(&token.node)?.clone();
        match plan_node.class {
            NodeClass::Noop => self.dispatch_noop(&plan_node),
            NodeClass::Control => self.dispatch_control(token, &plan_node),
            NodeClass::Opaque => self.dispatch_opaque(token, &plan_node),
        }
    }

    fn dispatch_noop(&mut self, plan_node: &NodePlan) -> Result<()> {
        // Reroute forwards its data input; comments have no ports at all
        if plan_node.kind == CoreNodeKind::Reroute {
            match self.assemble_params(plan_node) {
                Ok(params) => {
                    if let Some(value) = params.get("value") {
                        let mut outputs = HashMap::new();
                        outputs.insert("value".to_string(), value.clone());
                        self.ctx.record_outputs(&plan_node.id, outputs);
                    }
                }
                Err(error) => return self.fail_node(&plan_node.id, &plan_node.type_name, error),
            }
        }
        self.route(plan_node, &["exec_out".to_string()]);
        Ok(())
    }

    fn dispatch_control(&mut self, token: Token, plan_node: &NodePlan) -> Result<()> {
        if plan_node.kind == CoreNodeKind::SubWorkflowCall {
            return self.dispatch_subworkflow(token, plan_node);
        }
        // Catch manages its own events (it may be skipped entirely);
        // ThrowError always ends in a NodeFailed
        let started = Instant::now();
        if plan_node.kind != CoreNodeKind::Catch {
            self.publish_node_started(plan_node);
        }
        let failed_before = self.failed;
        let result = self.handle_control(plan_node);
        if result.is_ok()
            && self.failed == failed_before
            && !matches!(
                plan_node.kind,
                CoreNodeKind::ThrowError | CoreNodeKind::Catch
            )
        {
            self.publish_node_completed(&plan_node.id, started, &[]);
        }
        result
    }

    fn dispatch_opaque(&mut self, token: Token, plan_node: &NodePlan) -> Result<()> {
        let params = match self.assemble_params(plan_node) {
            Ok(params) => params,
            Err(error) => {
                return self.fail_node(&plan_node.id, &plan_node.type_name, error);
            }
        };

        let node = match self.instance(plan_node) {
            Ok(node) => node,
            Err(error) => {
                return self.fail_node(&plan_node.id, &plan_node.type_name, error);
            }
        };

        let node_ctx = Arc::new(NodeContext::new(
            Arc::clone(&self.ctx),
            plan_node.id.clone(),
            plan_node.type_name.clone(),
            params,
        ));
        let retry = plan_node.retry.clone();
        let breaker = self.inner.breakers.for_type(&plan_node.type_name);
        let cancel = self.ctx.cancellation_token().clone();
        let events = self.ctx.events().clone();
        let timeout = self.inner.config.node_timeout;
        let cpu_bound = plan_node.cpu_bound;
        let kinds = plan_node.resources.clone();
        let node_id = plan_node.id.clone();
        let type_name = plan_node.type_name.clone();
        let retried = Arc::clone(&self.retried);
        let resources_ctx = Arc::clone(&self.ctx);

        self.inflight.spawn(async move {
            let started = Instant::now();
            let attempt_events = events.clone();
            let result = run_with_retry(
                &retry,
                Some(breaker.as_ref()),
                &cancel,
                |_attempt| {
                    let node = Arc::clone(&node);
                    let node_ctx = Arc::clone(&node_ctx);
                    let events = attempt_events.clone();
                    let cancel = cancel.clone();
                    let kinds = kinds.clone();
                    let node_id = node_id.clone();
                    let type_name = type_name.clone();
                    let ctx = Arc::clone(&resources_ctx);
                    async move {
                        if cancel.is_cancelled() {
                            return Err(EngineError::Cancelled);
                        }
                        events.publish(ExecutionEvent::NodeStarted {
                            node_id: node_id.clone(),
                            type_name,
                            start_time: Utc::now(),
                        });
                        let _cpu_slot = if cpu_bound {
                            Some(ctx.blocking_slot().await?)
                        } else {
                            None
                        };
                        node_ctx.install_guards(acquire_kinds(ctx.resources(), &kinds).await?);
                        let executed =
                            tokio::time::timeout(timeout, node.execute(&node_ctx)).await;
                        node_ctx.clear_guards();
                        match executed {
                            Ok(result) => Ok(result),
                            Err(_) => Err(EngineError::Timeout {
                                operation: format!("node '{}'", node_id),
                            }),
                        }
                    }
                },
                |attempt, error| {
                    events.publish(ExecutionEvent::NodeFailed {
                        node_id: node_id.clone(),
                        error_kind: error.kind().to_string(),
                        message: error.to_string(),
                        attempt,
                    });
                },
                |attempt, delay_ms| {
                    retried.fetch_add(1, Ordering::Relaxed);
                    events.publish(ExecutionEvent::NodeRetrying {
                        node_id: node_id.clone(),
                        attempt,
                        delay_ms,
                    });
                },
            )
            .await;

            TaskOutcome {
                token,
                type_name: node_ctx.type_name().to_string(),
                started,
                result,
                buffered_outputs: node_ctx.take_outputs(),
            }
        });
        Ok(())
    }

    fn dispatch_subworkflow(&mut self, token: Token, plan_node: &NodePlan) -> Result<()> {
        let record = self
            .plan
            .workflow
            .node(&plan_node.id)
            .ok_or_else(|| EngineError::internal("plan node missing from workflow"))?;

        let child_id = record.config_str("workflow").unwrap_or_default().to_string();
        let input_names = config_name_list(record.config.get("inputs"));
        let output_names = config_name_list(record.config.get("outputs"));

        let depth = self.ctx.depth() + 1;
        let max_depth = self.inner.config.max_subworkflow_depth;
        if depth > max_depth {
            return self.fail_node(
                &plan_node.id,
                &plan_node.type_name,
                EngineError::DepthExceeded { max_depth },
            );
        }

        self.publish_node_started(plan_node);

        let inner = Arc::clone(&self.inner);
        let parent_ctx = Arc::clone(&self.ctx);
        let pause_rx = self.pause_rx.clone();
        let type_name = plan_node.type_name.clone();

        self.inflight.spawn(async move {
            let started = Instant::now();
            let result = run_subworkflow(
                inner,
                parent_ctx,
                pause_rx,
                &child_id,
                depth,
                &input_names,
                &output_names,
            )
            .await;
            TaskOutcome {
                token,
                type_name,
                started,
                result,
                buffered_outputs: HashMap::new(),
            }
        });
        Ok(())
    }

    // -- join handling ------------------------------------------------------

    fn handle_outcome(&mut self, outcome: TaskOutcome) -> Result<()> {
        if self.is_stale(&outcome.token) {
            log::debug!(
                "discarding stale result from '{}' after unwind",
                outcome.token.node
            );
            return Ok(());
        }
        let node_id = outcome.token.node.clone();
        let plan_node = self.plan.node(&node_id)?.clone();

        match outcome.result {
            Ok(NodeResult::Ok {
                outputs,
                next_execs,
            }) => {
                let mut merged = outcome.buffered_outputs;
                merged.extend(outputs);
                let names: Vec<String> = merged.keys().cloned().collect();
                self.ctx.record_outputs(&node_id, merged);
                self.publish_node_completed(&node_id, outcome.started, &names);
                self.completed += 1;
                self.route(&plan_node, &next_execs);
                Ok(())
            }
            Ok(NodeResult::Signal(signal)) => {
                self.publish_node_completed(&node_id, outcome.started, &[]);
                match signal {
                    ControlSignal::Break => self.unwind_loop(&node_id, true),
                    ControlSignal::Continue => self.unwind_loop(&node_id, false),
                    ControlSignal::Throw { kind, message } => self.fail_node(
                        &node_id,
                        &outcome.type_name,
                        EngineError::Node {
                            kind,
                            message,
                            retryable: false,
                        },
                    ),
                }
            }
            Ok(NodeResult::Fail {
                kind,
                message,
                retryable,
            }) => {
                // The retry wrapper normally converts Fail; keep a fallback
                self.failed += 1;
                self.handle_failure(
                    &node_id,
                    EngineError::Node {
                        kind,
                        message,
                        retryable,
                    },
                )
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(error) => {
                self.failed += 1;
                self.handle_failure(&node_id, error)
            }
        }
    }

    // -- control-flow interpretation ---------------------------------------

    fn handle_control(&mut self, plan_node: &NodePlan) -> Result<()> {
        let node_id = &plan_node.id;
        match plan_node.kind {
            CoreNodeKind::Start | CoreNodeKind::Merge => {
                self.route(plan_node, &["exec_out".to_string()]);
                Ok(())
            }
            CoreNodeKind::End => Ok(()),
            CoreNodeKind::If => {
                let condition = self.config_template(node_id, "condition");
                match self.ctx.resolve(&condition) {
                    Ok(value) => {
                        let port = if eval_condition(&value) { "true" } else { "false" };
                        self.route(plan_node, &[port.to_string()]);
                        Ok(())
                    }
                    Err(error) => self.fail_node(node_id, &plan_node.type_name, error),
                }
            }
            CoreNodeKind::Switch => {
                let value_tpl = self.config_template(node_id, "value");
                let cases = self.switch_cases(node_id);
                match self.ctx.resolve(&value_tpl) {
                    Ok(value) => {
                        let port = switch_port(&value, &cases);
                        self.route(plan_node, &[port]);
                        Ok(())
                    }
                    Err(error) => self.fail_node(node_id, &plan_node.type_name, error),
                }
            }
            CoreNodeKind::ForLoopStart => self.control_loop_entry(plan_node, false),
            CoreNodeKind::WhileLoopStart => self.control_loop_entry(plan_node, true),
            CoreNodeKind::ForLoopEnd | CoreNodeKind::WhileLoopEnd => {
                self.route(plan_node, &["loop".to_string()]);
                Ok(())
            }
            CoreNodeKind::Break => self.unwind_loop(node_id, true),
            CoreNodeKind::Continue => self.unwind_loop(node_id, false),
            CoreNodeKind::Try => {
                self.frames.push(Frame::Try(TryFrame {
                    try_node: node_id.clone(),
                    catch_node: plan_node.catch_node.clone(),
                    finally_node: plan_node.finally_node.clone(),
                    state: TryState::Body,
                    pending_error: None,
                }));
                self.route(plan_node, &["body".to_string()]);
                Ok(())
            }
            CoreNodeKind::Catch => self.control_catch(plan_node),
            CoreNodeKind::Finally => self.control_finally(plan_node),
            CoreNodeKind::Retry => {
                let exists = self
                    .frames
                    .iter()
                    .any(|f| matches!(f, Frame::Retry(rf) if rf.retry_node == *node_id));
                if !exists {
                    let max_attempts = self
                        .plan
                        .workflow
                        .node(node_id)
                        .and_then(|n| n.config.get("max_attempts"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(3) as u32;
                    self.frames.push(Frame::Retry(RetryFrame {
                        retry_node: node_id.clone(),
                        attempt: 1,
                        max_attempts: max_attempts.max(1),
                    }));
                }
                self.route(plan_node, &["body".to_string()]);
                Ok(())
            }
            CoreNodeKind::ThrowError => {
                let record = self.plan.workflow.node(node_id);
                let kind = record
                    .and_then(|n| n.config_str("error_type"))
                    .unwrap_or("UserError")
                    .to_string();
                let message_tpl = self.config_template(node_id, "message");
                let message = match self.ctx.resolve(&message_tpl) {
                    Ok(value) => value.render(),
                    Err(error) => error.to_string(),
                };
                self.fail_node(
                    node_id,
                    &plan_node.type_name,
                    EngineError::Node {
                        kind,
                        message,
                        retryable: false,
                    },
                )
            }
            _ => Err(EngineError::internal(format!(
                "kind {:?} is not a control construct",
                plan_node.kind
            ))),
        }
    }

    fn control_loop_entry(&mut self, plan_node: &NodePlan, is_while: bool) -> Result<()> {
        let node_id = plan_node.id.clone();
        let on_stack = self
            .frames
            .iter()
            .rposition(|f| matches!(f, Frame::Loop(lf) if lf.start_node == node_id));

        let idx = match on_stack {
            Some(idx) => idx,
            None => {
                // First entry: build the frame and its variable scope
                let params = match self.assemble_params(plan_node) {
                    Ok(params) => params,
                    Err(error) => {
                        return self.fail_node(&node_id, &plan_node.type_name, error)
                    }
                };
                let max_iterations = params
                    .get("max_iterations")
                    .and_then(|v| v.as_int())
                    .map(|n| n.max(0) as u64)
                    .unwrap_or(self.inner.config.max_iterations);
                let item_var = params
                    .get("item_var")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "item".to_string());
                let index_var = params
                    .get("index_var")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "index".to_string());
                let source = if is_while {
                    None
                } else {
                    match LoopSource::from_params(&node_id, &params) {
                        Ok(source) => Some(source),
                        Err(error) => {
                            return self.fail_node(&node_id, &plan_node.type_name, error)
                        }
                    }
                };
                let end_node = match plan_node.loop_end.clone() {
                    Some(end) => end,
                    None => {
                        return self.fail_node(
                            &node_id,
                            &plan_node.type_name,
                            EngineError::internal(format!("loop '{}' has no paired end", node_id)),
                        )
                    }
                };
                self.ctx.push_scope(ScopeKind::Loop);
                self.frames.push(Frame::Loop(LoopFrame {
                    start_node: node_id.clone(),
                    end_node,
                    source,
                    item_var,
                    index_var,
                    index: 0,
                    max_iterations,
                    breaking: false,
                }));
                self.frames.len() - 1
            }
        };

        let step = {
            let Some(Frame::Loop(frame)) = self.frames.get_mut(idx) else {
                return Err(EngineError::internal("loop frame vanished"));
            };
            if frame.breaking {
                LoopStep::Exit
            } else if frame.index >= frame.max_iterations {
                LoopStep::Fail(EngineError::InfiniteLoop {
                    node_id: node_id.clone(),
                    max_iterations: frame.max_iterations,
                })
            } else if is_while {
                frame.index += 1;
                LoopStep::Body {
                    item: None,
                    index: frame.index - 1,
                    item_var: frame.item_var.clone(),
                    index_var: frame.index_var.clone(),
                }
            } else {
                let next = frame.source.as_mut().and_then(LoopSource::next);
                match next {
                    Some(item) => {
                        frame.index += 1;
                        LoopStep::Body {
                            item: Some(item),
                            index: frame.index - 1,
                            item_var: frame.item_var.clone(),
                            index_var: frame.index_var.clone(),
                        }
                    }
                    None => LoopStep::Exit,
                }
            }
        };

        match step {
            LoopStep::Fail(error) => self.fail_node(&node_id, &plan_node.type_name, error),
            LoopStep::Exit => {
                self.frames.truncate(idx);
                self.ctx.pop_scope();
                self.route(plan_node, &["completed".to_string()]);
                Ok(())
            }
            LoopStep::Body {
                item,
                index,
                item_var,
                index_var,
            } => {
                if let Some(item) = item {
                    self.ctx.declare_var(&item_var, item);
                }
                self.ctx.declare_var(&index_var, Value::Int(index as i64));
                if is_while {
                    // Condition is re-evaluated on every entry and may
                    // reference the index variable
                    let condition = self.config_template(&node_id, "condition");
                    let keep_going = match self.ctx.resolve(&condition) {
                        Ok(value) => eval_condition(&value),
                        Err(error) => {
                            return self.fail_node(&node_id, &plan_node.type_name, error)
                        }
                    };
                    if !keep_going {
                        self.frames.truncate(idx);
                        self.ctx.pop_scope();
                        self.route(plan_node, &["completed".to_string()]);
                        return Ok(());
                    }
                }
                self.route(plan_node, &["body".to_string()]);
                Ok(())
            }
        }
    }

    fn control_catch(&mut self, plan_node: &NodePlan) -> Result<()> {
        let node_id = &plan_node.id;
        let idx = self
            .frames
            .iter()
            .rposition(
                |f| matches!(f, Frame::Try(tf) if tf.catch_node.as_deref() == Some(node_id.as_str())),
            );
        let Some(idx) = idx else {
            // Arrived outside any try frame; nothing to handle
            log::warn!("catch '{}' reached without an active try frame", node_id);
            return Ok(());
        };

        let (state, finally_node) = {
            let Some(Frame::Try(tf)) = self.frames.get(idx) else {
                return Err(EngineError::internal("try frame vanished"));
            };
            (tf.state, tf.finally_node.clone())
        };

        match state {
            TryState::Catching => {
                // An error is active: run the catch branch
                let started = Instant::now();
                self.publish_node_started(plan_node);
                if finally_node.is_none() {
                    // The error is consumed here and nothing else remains
                    // for this frame to do
                    self.frames.remove(idx);
                }
                self.publish_node_completed(node_id, started, &[]);
                self.route(plan_node, &["exec_out".to_string()]);
                Ok(())
            }
            TryState::Body => {
                // Success path: skip the catch branch entirely
                match finally_node {
                    Some(finally) => self.enqueue(&finally),
                    None => {
                        self.frames.remove(idx);
                    }
                }
                Ok(())
            }
            TryState::Finished => Ok(()),
        }
    }

    fn control_finally(&mut self, plan_node: &NodePlan) -> Result<()> {
        let node_id = &plan_node.id;
        let idx = self
            .frames
            .iter()
            .rposition(
                |f| matches!(f, Frame::Try(tf) if tf.finally_node.as_deref() == Some(node_id.as_str())),
            );
        let Some(idx) = idx else {
            log::warn!("finally '{}' reached without an active try frame", node_id);
            self.route(plan_node, &["exec_out".to_string()]);
            return Ok(());
        };

        let Frame::Try(frame) = self.frames.remove(idx) else {
            return Err(EngineError::internal("try frame vanished"));
        };

        match frame.pending_error {
            // Unconsumed error: the finally branch does not continue,
            // the failure resumes its way out
            Some(error) => self.handle_failure(node_id, error),
            None => {
                self.route(plan_node, &["exec_out".to_string()]);
                Ok(())
            }
        }
    }

    // -- failure routing ----------------------------------------------------

    /// Driver-side failure entry: publishes the per-attempt event that the
    /// retry wrapper would have published, then routes the failure
    fn fail_node(&mut self, node_id: &str, _type_name: &str, error: EngineError) -> Result<()> {
        self.ctx.events().publish(ExecutionEvent::NodeFailed {
            node_id: node_id.to_string(),
            error_kind: error.kind().to_string(),
            message: error.to_string(),
            attempt: 1,
        });
        self.failed += 1;
        self.handle_failure(node_id, error)
    }

    /// Route a failure through the frame stack; `Err` means the run dies
    fn handle_failure(&mut self, node_id: &str, error: EngineError) -> Result<()> {
        let mut error = error;
        loop {
            let Some(frame) = self.frames.pop() else {
                return Err(error);
            };
            let depth = self.frames.len();
            match frame {
                Frame::Loop(_) => {
                    // Failures are not loop-scoped; drop the frame and its
                    // variable scope on the way out
                    self.ctx.pop_scope();
                }
                Frame::Retry(mut rf) => {
                    if rf.attempt < rf.max_attempts {
                        rf.attempt += 1;
                        let target = rf.retry_node.clone();
                        let attempt = rf.attempt;
                        self.frames.push(Frame::Retry(rf));
                        self.purge_deeper_than(depth);
                        self.retried.fetch_add(1, Ordering::Relaxed);
                        self.ctx.events().publish(ExecutionEvent::NodeRetrying {
                            node_id: target.clone(),
                            attempt,
                            delay_ms: 0,
                        });
                        self.enqueue(&target);
                        return Ok(());
                    }
                    // Attempts exhausted: keep unwinding with the error
                }
                Frame::Try(mut tf) => match tf.state {
                    TryState::Body => {
                        tf.state = TryState::Catching;
                        self.set_error_scope(node_id, &error);
                        let target = tf.catch_node.clone().or_else(|| tf.finally_node.clone());
                        if let Some(target) = target {
                            if tf.catch_node.is_none() {
                                tf.pending_error = Some(error);
                            }
                            self.frames.push(Frame::Try(tf));
                            self.purge_deeper_than(depth);
                            self.enqueue(&target);
                            return Ok(());
                        }
                        // A try with neither catch nor finally: transparent
                    }
                    TryState::Catching => {
                        // Failure inside the catch branch: finally still
                        // runs once, then the new error continues out
                        if let Some(finally) = tf.finally_node.clone() {
                            tf.pending_error = Some(error);
                            self.frames.push(Frame::Try(tf));
                            self.purge_deeper_than(depth);
                            self.enqueue(&finally);
                            return Ok(());
                        }
                    }
                    TryState::Finished => {}
                },
            }
        }
    }

    fn unwind_loop(&mut self, node_id: &str, breaking: bool) -> Result<()> {
        let Some(idx) = self
            .frames
            .iter()
            .rposition(|f| matches!(f, Frame::Loop(_)))
        else {
            return self.fail_node(
                node_id,
                "",
                EngineError::internal(format!("'{}' signalled outside any loop", node_id)),
            );
        };

        // Drop frames opened inside the loop body
        while self.frames.len() > idx + 1 {
            if let Some(Frame::Loop(_)) = self.frames.pop() {
                self.ctx.pop_scope();
            }
        }
        self.purge_deeper_than(idx);

        let target = {
            let Some(Frame::Loop(frame)) = self.frames.get_mut(idx) else {
                return Err(EngineError::internal("loop frame vanished"));
            };
            if breaking {
                frame.breaking = true;
                frame.end_node.clone()
            } else {
                frame.start_node.clone()
            }
        };
        self.enqueue(&target);
        Ok(())
    }

    fn set_error_scope(&mut self, node_id: &str, error: &EngineError) {
        let (error_type, message) = match error {
            EngineError::Node { kind, message, .. } => (kind.clone(), message.clone()),
            other => (other.kind().to_string(), other.to_string()),
        };
        self.ctx.set_var("error_message", Value::Str(message));
        self.ctx.set_var("error_type", Value::Str(error_type));
        self.ctx.set_var(
            "stack_trace",
            Value::Str(format!("at node '{}' in workflow '{}'", node_id, self.ctx.workflow().id)),
        );
    }

    // -- plumbing -----------------------------------------------------------

    /// Enqueue tokens for every target of the given execution output ports
    fn route(&mut self, plan_node: &NodePlan, ports: &[String]) {
        for port in ports {
            let targets: Vec<NodeId> = plan_node.targets_of(port).cloned().collect();
            if targets.is_empty() {
                log::trace!("'{}':{} has no outgoing edge", plan_node.id, port);
            }
            for target in targets {
                self.enqueue(&target);
            }
        }
    }

    fn enqueue(&mut self, node: &str) {
        self.queue.push_back(Token {
            node: node.to_string(),
            frame_depth: self.frames.len(),
            epoch: self.epoch,
        });
    }

    fn purge_deeper_than(&mut self, depth: usize) {
        self.queue.retain(|t| t.frame_depth <= depth);
        self.epoch += 1;
        self.unwinds.push(Unwind {
            epoch: self.epoch,
            depth,
        });
    }

    fn is_stale(&self, token: &Token) -> bool {
        self.unwinds
            .iter()
            .any(|u| u.epoch > token.epoch && token.frame_depth > u.depth)
    }

    fn instance(&mut self, plan_node: &NodePlan) -> Result<Arc<dyn Node>> {
        if let Some(node) = self.instances.get(&plan_node.id) {
            return Ok(Arc::clone(node));
        }
        let record = self
            .plan
            .workflow
            .node(&plan_node.id)
            .ok_or_else(|| EngineError::internal("plan node missing from workflow"))?;
        let node = self.inner.registry.create(record)?;
        self.instances.insert(plan_node.id.clone(), Arc::clone(&node));
        Ok(node)
    }

    /// Build the parameter map: config (templates resolved) overlaid by
    /// connected data inputs, topped up with declared defaults
    fn assemble_params(&self, plan_node: &NodePlan) -> Result<HashMap<String, Value>> {
        let record = self
            .plan
            .workflow
            .node(&plan_node.id)
            .ok_or_else(|| EngineError::internal("plan node missing from workflow"))?;

        let mut params = HashMap::new();
        for (key, raw) in &record.config {
            let value = match raw.as_str() {
                Some(template) => self.ctx.resolve(template)?,
                None => Value::from_json(raw),
            };
            params.insert(key.clone(), value);
        }

        for edge in &plan_node.data_inputs {
            let Some(value) = self.ctx.output(&edge.source_node, &edge.source_port) else {
                // Producer did not run (untaken branch); config/default holds
                continue;
            };
            let value = if value.data_type().is_compatible_with(&edge.target_type) {
                value
            } else {
                value
                    .coerce_to(edge.target_type)
                    .ok_or_else(|| EngineError::TypeMismatch {
                        port: format!("{}:{}", plan_node.id, edge.input_port),
                        expected: format!("{:?}", edge.target_type),
                        actual: format!("{:?}", value.data_type()),
                    })?
            };
            params.insert(edge.input_port.clone(), value);
        }

        for def in &plan_node.ports.inputs {
            if def.data_type.is_execution() || params.contains_key(&def.name) {
                continue;
            }
            if let Some(default) = &def.default_value {
                params.insert(def.name.clone(), Value::from_json(default));
            }
        }

        Ok(params)
    }

    fn config_template(&self, node_id: &str, key: &str) -> String {
        self.plan
            .workflow
            .node(node_id)
            .and_then(|n| n.config_str(key))
            .unwrap_or_default()
            .to_string()
    }

    fn switch_cases(&self, node_id: &str) -> Vec<String> {
        self.plan
            .workflow
            .node(node_id)
            .and_then(|n| n.config.get("cases"))
            .and_then(|v| v.as_array())
            .map(|cases| {
                cases
                    .iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish_node_started(&self, plan_node: &NodePlan) {
        self.ctx.events().publish(ExecutionEvent::NodeStarted {
            node_id: plan_node.id.clone(),
            type_name: plan_node.type_name.clone(),
            start_time: Utc::now(),
        });
    }

    fn publish_node_completed(&mut self, node_id: &str, started: Instant, outputs: &[String]) {
        self.ctx.events().publish(ExecutionEvent::NodeCompleted {
            node_id: node_id.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            outputs: outputs.to_vec(),
        });
    }
}

/// Acquire the declared resource kinds for one attempt
async fn acquire_kinds(
    resources: &RunResources,
    kinds: &[ResourceKind],
) -> Result<Vec<ReservedResource>> {
    let mut guards = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let guard = match kind {
            ResourceKind::Browser => ReservedResource::Browser(resources.acquire_browser().await?),
            ResourceKind::Http => ReservedResource::Http(resources.acquire_http().await?),
            ResourceKind::Database => {
                ReservedResource::Database(resources.acquire_database("").await?)
            }
        };
        guards.push(guard);
    }
    Ok(guards)
}

fn config_name_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Run a referenced child workflow to completion and map its variables
async fn run_subworkflow(
    inner: Arc<EngineInner>,
    parent_ctx: Arc<ExecutionContext>,
    pause_rx: watch::Receiver<bool>,
    child_id: &str,
    depth: usize,
    input_names: &[String],
    output_names: &[String],
) -> Result<NodeResult> {
    let child_workflow: Arc<Workflow> =
        inner
            .resolver
            .resolve(child_id)
            .ok_or_else(|| EngineError::Node {
                kind: "SubWorkflowNotFound".to_string(),
                message: format!("no workflow registered under '{}'", child_id),
                retryable: false,
            })?;
    let plan = compile_cached(&inner, Arc::clone(&child_workflow))?;

    let child_ctx = Arc::new(ExecutionContext::new(
        format!("{}/{}", parent_ctx.run_id(), Uuid::new_v4()),
        child_workflow,
        RunResources::new(
            Arc::clone(&inner.resources),
            inner.config.resource_quota,
            inner.config.quota_fail_fast,
        ),
        parent_ctx.events().clone(),
        Arc::clone(&inner.credentials),
        parent_ctx.cancellation_token().child_token(),
        depth,
        inner.config.blocking_workers,
    ));

    // Copy declared inputs into the child's workflow scope
    for name in input_names {
        let value = parent_ctx.get_var(name)?;
        child_ctx.set_var(name, value);
    }

    let (state_tx, _state_rx) = watch::channel(RunState::Pending);
    let result = Box::pin(drive_run(
        Arc::clone(&inner),
        plan,
        Arc::clone(&child_ctx),
        pause_rx,
        state_tx,
    ))
    .await;

    match result.state {
        RunState::Completed => {
            for name in output_names {
                if let Some(value) = result.variables.get(name) {
                    parent_ctx.set_var(name, value.clone());
                }
            }
            Ok(NodeResult::ok())
        }
        RunState::Cancelled => Err(EngineError::Cancelled),
        _ => Err(result
            .error
            .unwrap_or_else(|| EngineError::internal("sub-workflow failed without an error"))),
    }
}
