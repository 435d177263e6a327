//! Workflow-scope variable definitions and identifier rules

use serde::{Deserialize, Serialize};

/// Longest accepted variable name
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Names the engine reserves for itself or the condition language.
///
/// `error_message`, `error_type` and `stack_trace` are populated by the
/// engine when routing a failure into a Catch branch.
pub const RESERVED_NAMES: &[&str] = &[
    "true", "false", "null", "if", "else", "for", "while", "break", "continue", "try", "catch",
    "finally", "error_message", "error_type", "stack_trace",
];

/// The declared type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Dict,
    DataTable,
    Any,
}

/// A workflow-scope variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDef {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    /// Initial value, JSON-typed at design time
    #[serde(default)]
    pub value: serde_json::Value,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, var_type: VariableType, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            var_type,
            value,
        }
    }
}

/// Check a variable name against the identifier rules.
///
/// Letters, digits and underscores; must not start with a digit; at most
/// [`MAX_IDENTIFIER_LEN`] chars; not a reserved keyword.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    !RESERVED_NAMES.contains(&name)
}
