//! Workflow document loading
//!
//! Parses the persisted JSON form into a [`Workflow`] and runs the full
//! validator. The parser tolerates unknown fields for forward
//! compatibility; validation failures carry every offense found.

use thiserror::Error;

use crate::node::PortCatalog;
use crate::validation::{validate_workflow, ValidationError};
use crate::workflow::Workflow;

/// Why a workflow document failed to load
#[derive(Debug, Error)]
pub enum LoadError {
    /// The document is not syntactically valid
    #[error("workflow parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but violates structural invariants
    #[error("workflow validation failed with {} offense(s)", .0.len())]
    Validation(Vec<ValidationError>),
}

impl LoadError {
    /// The validation offenses, if any
    pub fn offenses(&self) -> &[ValidationError] {
        match self {
            LoadError::Validation(errors) => errors,
            LoadError::Parse(_) => &[],
        }
    }
}

/// Parse and validate a workflow document.
///
/// Never partially succeeds: the returned workflow satisfies every
/// invariant, or the error lists all offenses.
pub fn load_workflow(json: &str, catalog: &dyn PortCatalog) -> Result<Workflow, LoadError> {
    let workflow: Workflow = serde_json::from_str(json)?;
    let errors = validate_workflow(&workflow, catalog);
    if errors.is_empty() {
        Ok(workflow)
    } else {
        Err(LoadError::Validation(errors))
    }
}

/// Validate an already-built workflow (used by embedding hosts that
/// construct graphs programmatically).
pub fn check_workflow(workflow: &Workflow, catalog: &dyn PortCatalog) -> Result<(), LoadError> {
    let errors = validate_workflow(workflow, catalog);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LoadError::Validation(errors))
    }
}

/// Serialize a workflow back to its persisted form
pub fn serialize_workflow(workflow: &Workflow) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CoreCatalog;

    const MINIMAL: &str = r#"{
        "version": 1,
        "id": "wf-1",
        "name": "Minimal",
        "nodes": {
            "start": { "id": "start", "typeName": "Start" },
            "end": { "id": "end", "typeName": "End" }
        },
        "connections": [
            {
                "sourceNode": "start",
                "sourcePort": "exec_out",
                "targetNode": "end",
                "targetPort": "exec_in"
            }
        ],
        "variables": [
            { "name": "x", "type": "integer", "value": 15 }
        ]
    }"#;

    #[test]
    fn test_load_minimal() {
        let wf = load_workflow(MINIMAL, &CoreCatalog).unwrap();
        assert_eq!(wf.id, "wf-1");
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.variables.len(), 1);
    }

    #[test]
    fn test_snake_case_field_names_accepted() {
        let json = r#"{
            "version": 1, "id": "wf-2", "name": "Aliases",
            "nodes": {
                "start": { "id": "start", "type_name": "Start" },
                "end": { "id": "end", "type_name": "End" }
            },
            "connections": [
                {
                    "source_node": "start",
                    "source_port": "exec_out",
                    "target_node": "end",
                    "target_port": "exec_in"
                }
            ]
        }"#;
        let wf = load_workflow(json, &CoreCatalog).unwrap();
        assert_eq!(wf.connections.len(), 1);
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = MINIMAL.replacen(
            "\"version\": 1,",
            "\"version\": 1, \"futureField\": {\"a\": 1},",
            1,
        );
        assert!(load_workflow(&json, &CoreCatalog).is_ok());
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            load_workflow("{not json", &CoreCatalog),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_required_key() {
        let json = r#"{ "version": 1, "id": "wf", "nodes": {}, "connections": [] }"#;
        assert!(matches!(
            load_workflow(json, &CoreCatalog),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_graph_lists_offenses() {
        let json = r#"{
            "version": 1, "id": "wf", "name": "Bad",
            "nodes": { "end": { "id": "end", "type_name": "End" } },
            "connections": []
        }"#;
        let err = load_workflow(json, &CoreCatalog).unwrap_err();
        assert!(!err.offenses().is_empty());
    }

    #[test]
    fn test_round_trip_determinism() {
        let first = load_workflow(MINIMAL, &CoreCatalog).unwrap();
        let serialized = serialize_workflow(&first).unwrap();
        let second = load_workflow(&serialized, &CoreCatalog).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.content_hash(), second.content_hash());
    }

    #[test]
    fn test_dangerous_pattern_rejected_at_load() {
        let json = MINIMAL.replacen("Minimal", "uses pickle here", 1);
        let err = load_workflow(&json, &CoreCatalog).unwrap_err();
        assert!(matches!(err, LoadError::Validation(_)));
    }
}
