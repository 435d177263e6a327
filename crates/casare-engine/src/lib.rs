//! Workflow execution core for CasareRPA
//!
//! Takes a validated workflow graph from `casare-workflow` and runs it to
//! completion: typed data flow along edges, control-flow constructs
//! (if/switch, loops, break/continue, try/catch/finally, retry blocks,
//! sub-workflows), automatic parallelization of independent branches,
//! pooled shared resources, per-node retry with a per-type circuit
//! breaker, cooperative cancellation, pause/resume and a per-run event
//! stream.
//!
//! # Entry points
//!
//! - [`Engine`]: owns the registry, pools, breakers and plan cache;
//!   `run(workflow)` yields a [`RunHandle`]
//! - [`Node`] / [`NodeFactory`]: the contract action packs implement
//! - [`ExecutionEvent`]: what subscribers observe during a run

pub mod breaker;
pub mod config;
pub mod context;
pub mod control;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod events;
mod executor;
pub mod node;
pub mod registry;
pub mod resources;
pub mod retry;
pub mod scheduler;
pub mod variables;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStats, CircuitBreaker};
pub use config::EngineConfig;
pub use context::{ExecutionContext, NodeContext};
pub use credentials::{CredentialHandle, CredentialStore, NullCredentialStore};
pub use engine::{Engine, EngineBuilder, InMemoryResolver, NoSubWorkflows, RunHandle, WorkflowResolver};
pub use error::{EngineError, Result};
pub use events::{EventBus, ExecutionEvent, RunSummary};
pub use executor::{RunResult, RunState};
pub use node::{ControlSignal, Node, NodeResult};
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry};
pub use resources::rate_limit::{RateLimiterMap, SlidingWindowLimiter};
pub use resources::{
    BrowserDriver, BrowserSession, DatabaseConnector, DbSession, HttpSession, ResourceConfig,
    ResourceGuard, ResourceKind, ResourceManager, RunResources,
};
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionPlan, NodeClass};
pub use variables::{ScopeKind, VariableStore};
