//! Error types for the execution core
//!
//! `EngineError` is a closed set: every failure a run can observe maps to
//! exactly one kind, and each kind has a fixed retryability.

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the execution core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The workflow graph fails load-time invariants
    #[error("workflow validation failed: {}", offenses.join("; "))]
    WorkflowValidation { offenses: Vec<String> },

    /// A node's type is not present in the registry
    #[error("unknown node type '{type_name}'")]
    UnknownNodeType { type_name: String },

    /// A placeholder or variable read referenced a name that is not bound
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },

    /// A value did not match the type of the port it flowed into
    #[error("type mismatch on '{port}': expected {expected}, got {actual}")]
    TypeMismatch {
        port: String,
        expected: String,
        actual: String,
    },

    /// An operation exceeded its time bound
    #[error("timeout: {operation}")]
    Timeout { operation: String },

    /// A pool was full or a quota was exceeded
    #[error("resource exhausted: {what}")]
    ResourceExhausted { what: String },

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// The circuit breaker denied the call
    #[error("circuit open for node type '{type_name}'")]
    CircuitOpen { type_name: String },

    /// A node reported a failure
    #[error("node error [{kind}]: {message}")]
    Node {
        kind: String,
        message: String,
        retryable: bool,
    },

    /// A loop hit its iteration cap
    #[error("loop '{node_id}' exceeded {max_iterations} iterations")]
    InfiniteLoop {
        node_id: String,
        max_iterations: u64,
    },

    /// Sub-workflow nesting exceeded the depth bound
    #[error("sub-workflow depth limit of {max_depth} exceeded")]
    DepthExceeded { max_depth: usize },

    /// The engine reached a state it should not be able to reach
    #[error("internal engine error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Short stable name of the error kind, carried in events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowValidation { .. } => "WorkflowValidationError",
            Self::UnknownNodeType { .. } => "UnknownNodeType",
            Self::UndefinedVariable { .. } => "UndefinedVariable",
            Self::TypeMismatch { .. } => "TypeMismatch",
            Self::Timeout { .. } => "Timeout",
            Self::ResourceExhausted { .. } => "ResourceExhausted",
            Self::Cancelled => "Cancelled",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::Node { .. } => "NodeError",
            Self::InfiniteLoop { .. } => "InfiniteLoop",
            Self::DepthExceeded { .. } => "DepthExceeded",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Whether the retry wrapper may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ResourceExhausted { .. } | Self::CircuitOpen { .. } => {
                true
            }
            Self::Node { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a node-reported failure
    pub fn node(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Node {
            kind: kind.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl From<casare_workflow::LoadError> for EngineError {
    fn from(err: casare_workflow::LoadError) -> Self {
        match err {
            casare_workflow::LoadError::Parse(e) => Self::WorkflowValidation {
                offenses: vec![e.to_string()],
            },
            casare_workflow::LoadError::Validation(errors) => Self::WorkflowValidation {
                offenses: errors.iter().map(|e| e.to_string()).collect(),
            },
        }
    }
}
