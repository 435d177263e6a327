//! Workflow data model for the CasareRPA execution core
//!
//! This crate owns everything a workflow *is*: nodes, typed ports,
//! execution and data edges, variable declarations, the persisted JSON
//! form and its validator. It has no runtime state; execution lives in
//! `casare-engine`.
//!
//! # Overview
//!
//! - [`Workflow`]: the immutable graph container
//! - [`NodeRecord`] / [`CoreNodeKind`]: node instances and the control
//!   kinds the engine interprets itself
//! - [`Connection`]: edges between ports; execution edges drive control
//!   flow, data edges carry [`Value`]s
//! - [`load_workflow`]: tolerant parsing plus full invariant validation

pub mod connection;
pub mod loader;
pub mod node;
pub mod types;
pub mod validation;
pub mod value;
pub mod variables;
pub mod workflow;

pub use connection::Connection;
pub use loader::{check_workflow, load_workflow, serialize_workflow, LoadError};
pub use node::{CoreCatalog, CoreNodeKind, NodeRecord, PortCatalog};
pub use types::{NodeId, NodePorts, PortDataType, PortDefinition, PortDirection, PortName};
pub use validation::{planning_edges, validate_workflow, Pairing, ValidationError};
pub use value::{HandleValue, Value};
pub use variables::{is_valid_identifier, VariableDef, VariableType};
pub use workflow::{Workflow, WORKFLOW_VERSION};
