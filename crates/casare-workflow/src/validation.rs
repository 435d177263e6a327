//! Load-time workflow validation
//!
//! Validates graph structure, port types, control-flow pairing and
//! identifier rules. All offenses are collected; a workflow either passes
//! every invariant or the load fails with the full list.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::connection::Connection;
use crate::node::{CoreNodeKind, NodeRecord, PortCatalog};
use crate::types::{NodeId, NodePorts, PortDataType};
use crate::variables::is_valid_identifier;
use crate::workflow::Workflow;

/// String fragments rejected anywhere in workflow content.
///
/// These cover language-execution constructs that have no business inside
/// a workflow document.
pub const DANGEROUS_PATTERNS: &[&str] = &["subprocess", "pickle", "marshal", "builtins", "<script"];

/// A single validation offense with location context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No `Start` node present
    MissingStartNode,
    /// More than one `Start` node present
    MultipleStartNodes { node_ids: Vec<NodeId> },
    /// A node cannot be reached from `Start` via execution edges
    UnreachableNode { node_id: NodeId },
    /// A node's type is not known to the catalog
    UnknownNodeType { node_id: NodeId, type_name: String },
    /// An edge references a node that does not exist
    UnknownNode { node_id: NodeId },
    /// An edge references a port that does not exist on its node
    UnknownPort { node_id: NodeId, port: String },
    /// An edge connects incompatible port types
    IncompatiblePortTypes {
        source: (NodeId, String),
        target: (NodeId, String),
        source_type: PortDataType,
        target_type: PortDataType,
    },
    /// A non-branching execution output has more than one outgoing edge
    ExecFanOut { node_id: NodeId, port: String },
    /// A data input has more than one incoming edge
    MultipleDataSources { node_id: NodeId, port: String },
    /// An edge leaves and enters the same port
    SelfLoopPort { node_id: NodeId, port: String },
    /// A loop end is not paired with exactly one loop start (or vice versa)
    UnpairedLoop { node_id: NodeId },
    /// A Catch or Finally node is not paired with exactly one Try
    UnpairedHandler { node_id: NodeId },
    /// A Break or Continue node is not enclosed by a loop body
    OrphanLoopSignal { node_id: NodeId },
    /// The planning graph (without loop back-edges and try fallback edges)
    /// contains a cycle
    CycleDetected { node_ids: Vec<NodeId> },
    /// A variable name violates the identifier rules
    InvalidIdentifier { name: String },
    /// Two variables share a name
    DuplicateVariable { name: String },
    /// A for-loop range is configured with a zero step
    ZeroLoopStep { node_id: NodeId },
    /// A string field contains a denylisted pattern
    DangerousPattern { location: String, pattern: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStartNode => write!(f, "workflow has no Start node"),
            Self::MultipleStartNodes { node_ids } => {
                write!(f, "workflow has multiple Start nodes: {:?}", node_ids)
            }
            Self::UnreachableNode { node_id } => {
                write!(f, "node '{}' is unreachable from Start", node_id)
            }
            Self::UnknownNodeType { node_id, type_name } => {
                write!(f, "unknown node type '{}' for node '{}'", type_name, node_id)
            }
            Self::UnknownNode { node_id } => {
                write!(f, "edge references unknown node '{}'", node_id)
            }
            Self::UnknownPort { node_id, port } => {
                write!(f, "edge references unknown port '{}' on node '{}'", port, node_id)
            }
            Self::IncompatiblePortTypes {
                source,
                target,
                source_type,
                target_type,
            } => write!(
                f,
                "edge {}:{} -> {}:{} connects incompatible types {:?} -> {:?}",
                source.0, source.1, target.0, target.1, source_type, target_type
            ),
            Self::ExecFanOut { node_id, port } => write!(
                f,
                "execution output '{}' on non-branching node '{}' has multiple outgoing edges",
                port, node_id
            ),
            Self::MultipleDataSources { node_id, port } => write!(
                f,
                "data input '{}' on node '{}' has multiple incoming edges",
                port, node_id
            ),
            Self::SelfLoopPort { node_id, port } => {
                write!(f, "port '{}' on node '{}' connects to itself", port, node_id)
            }
            Self::UnpairedLoop { node_id } => {
                write!(f, "loop node '{}' is not paired one-to-one", node_id)
            }
            Self::UnpairedHandler { node_id } => {
                write!(f, "handler node '{}' is not paired with exactly one Try", node_id)
            }
            Self::OrphanLoopSignal { node_id } => {
                write!(f, "node '{}' is not enclosed by a loop body", node_id)
            }
            Self::CycleDetected { node_ids } => {
                write!(f, "cycle detected through nodes {:?}", node_ids)
            }
            Self::InvalidIdentifier { name } => {
                write!(f, "'{}' is not a valid variable name", name)
            }
            Self::DuplicateVariable { name } => {
                write!(f, "variable '{}' is declared more than once", name)
            }
            Self::ZeroLoopStep { node_id } => {
                write!(f, "for-loop '{}' has a zero range step", node_id)
            }
            Self::DangerousPattern { location, pattern } => {
                write!(f, "'{}' contains denylisted pattern '{}'", location, pattern)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Port definitions resolved for every node of a workflow
pub struct ResolvedPorts {
    ports: HashMap<NodeId, NodePorts>,
}

impl ResolvedPorts {
    /// Resolve port sets through the catalog, recording unknown types
    pub fn resolve(
        workflow: &Workflow,
        catalog: &dyn PortCatalog,
        errors: &mut Vec<ValidationError>,
    ) -> Self {
        let mut ports = HashMap::new();
        for (id, node) in &workflow.nodes {
            match catalog.ports(node) {
                Some(p) => {
                    ports.insert(id.clone(), p);
                }
                None => errors.push(ValidationError::UnknownNodeType {
                    node_id: id.clone(),
                    type_name: node.type_name.clone(),
                }),
            }
        }
        Self { ports }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodePorts> {
        self.ports.get(node_id)
    }

    /// Whether an edge is an execution edge (by its source port type)
    pub fn is_exec_edge(&self, conn: &Connection) -> Option<bool> {
        let def = self.get(&conn.source_node)?.output(&conn.source_port)?;
        Some(def.data_type.is_execution())
    }
}

/// Validate a workflow against every structural invariant.
///
/// Returns all offenses found; an empty vector means the workflow is valid.
pub fn validate_workflow(workflow: &Workflow, catalog: &dyn PortCatalog) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    scan_dangerous_patterns(workflow, &mut errors);
    validate_variables(workflow, &mut errors);

    let resolved = ResolvedPorts::resolve(workflow, catalog, &mut errors);

    validate_edges(workflow, &resolved, &mut errors);
    validate_start_and_reachability(workflow, &resolved, &mut errors);

    let pairing = Pairing::compute(workflow, &mut errors);
    validate_loop_signals(workflow, &pairing, &mut errors);
    validate_loop_steps(workflow, &mut errors);
    detect_cycles(workflow, &mut errors);

    errors
}

fn scan_value(location: &str, value: &serde_json::Value, errors: &mut Vec<ValidationError>) {
    match value {
        serde_json::Value::String(s) => scan_str(location, s, errors),
        serde_json::Value::Array(items) => {
            for item in items {
                scan_value(location, item, errors);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                scan_str(location, key, errors);
                scan_value(location, item, errors);
            }
        }
        _ => {}
    }
}

fn scan_str(location: &str, s: &str, errors: &mut Vec<ValidationError>) {
    for pattern in DANGEROUS_PATTERNS {
        if s.contains(pattern) {
            errors.push(ValidationError::DangerousPattern {
                location: location.to_string(),
                pattern: (*pattern).to_string(),
            });
        }
    }
}

fn scan_dangerous_patterns(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    scan_str("workflow.id", &workflow.id, errors);
    scan_str("workflow.name", &workflow.name, errors);
    for (id, node) in &workflow.nodes {
        let location = format!("node '{}'", id);
        scan_str(&location, &node.type_name, errors);
        for value in node.config.values() {
            scan_value(&location, value, errors);
        }
    }
    for var in &workflow.variables {
        let location = format!("variable '{}'", var.name);
        scan_str(&location, &var.name, errors);
        scan_value(&location, &var.value, errors);
    }
}

fn validate_variables(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for var in &workflow.variables {
        if !is_valid_identifier(&var.name) {
            errors.push(ValidationError::InvalidIdentifier {
                name: var.name.clone(),
            });
        }
        if !seen.insert(var.name.as_str()) {
            errors.push(ValidationError::DuplicateVariable {
                name: var.name.clone(),
            });
        }
    }
}

fn validate_edges(
    workflow: &Workflow,
    resolved: &ResolvedPorts,
    errors: &mut Vec<ValidationError>,
) {
    // Outgoing-edge counts per exec output, incoming counts per data input
    let mut exec_out_counts: HashMap<(NodeId, String), usize> = HashMap::new();
    let mut data_in_counts: HashMap<(NodeId, String), usize> = HashMap::new();

    for conn in &workflow.connections {
        let mut endpoints_ok = true;
        for node_id in [&conn.source_node, &conn.target_node] {
            if !workflow.nodes.contains_key(node_id) {
                errors.push(ValidationError::UnknownNode {
                    node_id: node_id.clone(),
                });
                endpoints_ok = false;
            }
        }
        if !endpoints_ok {
            continue;
        }

        // Both endpoints exist; resolve port definitions (skip silently when
        // the node type itself was unknown; that offense is already recorded)
        let src_ports = resolved.get(&conn.source_node);
        let tgt_ports = resolved.get(&conn.target_node);
        let (Some(src_ports), Some(tgt_ports)) = (src_ports, tgt_ports) else {
            continue;
        };

        let src_def = match src_ports.output(&conn.source_port) {
            Some(def) => def,
            None => {
                errors.push(ValidationError::UnknownPort {
                    node_id: conn.source_node.clone(),
                    port: conn.source_port.clone(),
                });
                continue;
            }
        };
        let tgt_def = match tgt_ports.input(&conn.target_port) {
            Some(def) => def,
            None => {
                errors.push(ValidationError::UnknownPort {
                    node_id: conn.target_node.clone(),
                    port: conn.target_port.clone(),
                });
                continue;
            }
        };

        if !src_def.data_type.is_compatible_with(&tgt_def.data_type) {
            errors.push(ValidationError::IncompatiblePortTypes {
                source: (conn.source_node.clone(), conn.source_port.clone()),
                target: (conn.target_node.clone(), conn.target_port.clone()),
                source_type: src_def.data_type,
                target_type: tgt_def.data_type,
            });
        }

        if conn.source_node == conn.target_node && conn.source_port == conn.target_port {
            errors.push(ValidationError::SelfLoopPort {
                node_id: conn.source_node.clone(),
                port: conn.source_port.clone(),
            });
        }

        if src_def.data_type.is_execution() {
            *exec_out_counts
                .entry((conn.source_node.clone(), conn.source_port.clone()))
                .or_insert(0) += 1;
        } else {
            *data_in_counts
                .entry((conn.target_node.clone(), conn.target_port.clone()))
                .or_insert(0) += 1;
        }
    }

    for ((node_id, port), count) in exec_out_counts {
        if count > 1 {
            let branching = workflow
                .node(&node_id)
                .map(|n| n.kind().is_branching())
                .unwrap_or(false);
            if !branching {
                errors.push(ValidationError::ExecFanOut { node_id, port });
            }
        }
    }

    for ((node_id, port), count) in data_in_counts {
        if count > 1 {
            errors.push(ValidationError::MultipleDataSources { node_id, port });
        }
    }
}

fn validate_start_and_reachability(
    workflow: &Workflow,
    resolved: &ResolvedPorts,
    errors: &mut Vec<ValidationError>,
) {
    let starts: Vec<&NodeRecord> = workflow
        .nodes
        .values()
        .filter(|n| n.kind() == CoreNodeKind::Start)
        .collect();

    let start = match starts.as_slice() {
        [] => {
            errors.push(ValidationError::MissingStartNode);
            return;
        }
        [single] => *single,
        many => {
            let mut ids: Vec<NodeId> = many.iter().map(|n| n.id.clone()).collect();
            ids.sort();
            errors.push(ValidationError::MultipleStartNodes { node_ids: ids });
            return;
        }
    };

    // BFS along execution edges (including loop back-edges and try fallback
    // edges; a Catch is reachable through its Try)
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(start.id.as_str());
    queue.push_back(start.id.as_str());
    while let Some(current) = queue.pop_front() {
        for conn in workflow.outgoing(current) {
            if resolved.is_exec_edge(conn) != Some(true) {
                continue;
            }
            if visited.insert(conn.target_node.as_str()) {
                queue.push_back(conn.target_node.as_str());
            }
        }
    }

    // Comments are free-floating annotations with no ports; everything
    // else must be on the execution flow
    let mut unreachable: Vec<&str> = workflow
        .nodes
        .values()
        .filter(|n| n.kind() != CoreNodeKind::Comment)
        .map(|n| n.id.as_str())
        .filter(|id| !visited.contains(*id))
        .collect();
    unreachable.sort_unstable();
    for id in unreachable {
        errors.push(ValidationError::UnreachableNode {
            node_id: id.to_string(),
        });
    }
}

/// Pairings between control-flow nodes, derived from edges.
///
/// Loop ends pair to loop starts through the `loop` back-edge; Catch and
/// Finally pair to their Try through the Try's fallback ports.
#[derive(Debug, Default, Clone)]
pub struct Pairing {
    /// loop start id -> loop end id
    pub loop_end_of: HashMap<NodeId, NodeId>,
    /// loop end id -> loop start id
    pub loop_start_of: HashMap<NodeId, NodeId>,
    /// try id -> catch id
    pub catch_of: HashMap<NodeId, NodeId>,
    /// try id -> finally id
    pub finally_of: HashMap<NodeId, NodeId>,
    /// catch/finally id -> try id
    pub try_of: HashMap<NodeId, NodeId>,
}

impl Pairing {
    /// Derive all pairings, recording pairing offenses
    pub fn compute(workflow: &Workflow, errors: &mut Vec<ValidationError>) -> Self {
        let mut pairing = Pairing::default();

        for (id, node) in &workflow.nodes {
            match node.kind() {
                CoreNodeKind::ForLoopEnd | CoreNodeKind::WhileLoopEnd => {
                    let starts: Vec<&Connection> =
                        workflow.outgoing_from_port(id, "loop").collect();
                    let ok = starts.len() == 1
                        && starts.first().is_some_and(|c| {
                            matches!(
                                workflow.node(&c.target_node).map(NodeRecord::kind),
                                Some(CoreNodeKind::ForLoopStart)
                                    | Some(CoreNodeKind::WhileLoopStart)
                            )
                        });
                    if ok {
                        let start_id = starts[0].target_node.clone();
                        if pairing.loop_end_of.contains_key(&start_id) {
                            // Two ends claim the same start
                            errors.push(ValidationError::UnpairedLoop {
                                node_id: id.clone(),
                            });
                        } else {
                            pairing.loop_end_of.insert(start_id.clone(), id.clone());
                            pairing.loop_start_of.insert(id.clone(), start_id);
                        }
                    } else {
                        errors.push(ValidationError::UnpairedLoop { node_id: id.clone() });
                    }
                }
                CoreNodeKind::Try => {
                    for (port, map, want) in [
                        ("catch", &mut pairing.catch_of, CoreNodeKind::Catch),
                        ("finally", &mut pairing.finally_of, CoreNodeKind::Finally),
                    ] {
                        let targets: Vec<&Connection> =
                            workflow.outgoing_from_port(id, port).collect();
                        match targets.as_slice() {
                            [] => {}
                            [conn] => {
                                if workflow.node(&conn.target_node).map(NodeRecord::kind)
                                    == Some(want)
                                {
                                    map.insert(id.clone(), conn.target_node.clone());
                                    pairing
                                        .try_of
                                        .insert(conn.target_node.clone(), id.clone());
                                } else {
                                    errors.push(ValidationError::UnpairedHandler {
                                        node_id: conn.target_node.clone(),
                                    });
                                }
                            }
                            _ => errors.push(ValidationError::UnpairedHandler {
                                node_id: id.clone(),
                            }),
                        }
                    }
                }
                _ => {}
            }
        }

        // Every loop start must have a paired end, every Catch/Finally a Try
        let mut orphans: Vec<NodeId> = Vec::new();
        for (id, node) in &workflow.nodes {
            match node.kind() {
                CoreNodeKind::ForLoopStart | CoreNodeKind::WhileLoopStart => {
                    if !pairing.loop_end_of.contains_key(id) {
                        orphans.push(id.clone());
                    }
                }
                CoreNodeKind::Catch | CoreNodeKind::Finally => {
                    if !pairing.try_of.contains_key(id) {
                        errors.push(ValidationError::UnpairedHandler { node_id: id.clone() });
                    }
                }
                _ => {}
            }
        }
        orphans.sort();
        for id in orphans {
            errors.push(ValidationError::UnpairedLoop { node_id: id });
        }

        pairing
    }

    /// Nodes inside a loop body: execution-reachable from the start's `body`
    /// port without passing the paired end
    pub fn loop_body(&self, workflow: &Workflow, start_id: &str) -> HashSet<NodeId> {
        let mut body = HashSet::new();
        let end_id = match self.loop_end_of.get(start_id) {
            Some(end) => end.as_str(),
            None => return body,
        };
        let mut queue: VecDeque<NodeId> = workflow
            .outgoing_from_port(start_id, "body")
            .map(|c| c.target_node.clone())
            .collect();
        while let Some(current) = queue.pop_front() {
            if current == end_id || current == start_id || !body.insert(current.clone()) {
                continue;
            }
            for conn in workflow.outgoing(&current) {
                queue.push_back(conn.target_node.clone());
            }
        }
        body
    }
}

fn validate_loop_signals(
    workflow: &Workflow,
    pairing: &Pairing,
    errors: &mut Vec<ValidationError>,
) {
    let signals: Vec<&NodeId> = workflow
        .nodes
        .iter()
        .filter(|(_, n)| matches!(n.kind(), CoreNodeKind::Break | CoreNodeKind::Continue))
        .map(|(id, _)| id)
        .collect();
    if signals.is_empty() {
        return;
    }

    let mut enclosed: HashSet<&NodeId> = HashSet::new();
    for start_id in pairing.loop_end_of.keys() {
        let body = pairing.loop_body(workflow, start_id);
        for id in &signals {
            if body.contains(*id) {
                enclosed.insert(*id);
            }
        }
    }

    let mut orphans: Vec<&&NodeId> = signals.iter().filter(|id| !enclosed.contains(*id)).collect();
    orphans.sort();
    for id in orphans {
        errors.push(ValidationError::OrphanLoopSignal {
            node_id: (**id).clone(),
        });
    }
}

fn validate_loop_steps(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    for (id, node) in &workflow.nodes {
        if node.kind() == CoreNodeKind::ForLoopStart
            && node.config_str("mode") == Some("range")
            && node.config.get("step").and_then(|v| v.as_i64()) == Some(0)
        {
            errors.push(ValidationError::ZeroLoopStep { node_id: id.clone() });
        }
    }
}

/// Edges of the planning graph: every connection except loop back-edges and
/// try fallback edges. The scheduler plans over exactly this set.
pub fn planning_edges(workflow: &Workflow) -> Vec<&Connection> {
    workflow
        .connections
        .iter()
        .filter(|conn| {
            let kind = match workflow.node(&conn.source_node) {
                Some(node) => node.kind(),
                None => return true,
            };
            match kind {
                CoreNodeKind::ForLoopEnd | CoreNodeKind::WhileLoopEnd => {
                    conn.source_port != "loop"
                }
                CoreNodeKind::Try => conn.source_port != "catch" && conn.source_port != "finally",
                _ => true,
            }
        })
        .collect()
}

/// Kahn's algorithm over the planning graph; any leftover nodes form a cycle
fn detect_cycles(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let edges = planning_edges(workflow);
    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for conn in &edges {
        if !workflow.nodes.contains_key(&conn.source_node)
            || !workflow.nodes.contains_key(&conn.target_node)
        {
            continue;
        }
        successors
            .entry(conn.source_node.as_str())
            .or_default()
            .push(conn.target_node.as_str());
        *in_degree.entry(conn.target_node.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut seen = 0usize;
    while let Some(current) = queue.pop_front() {
        seen += 1;
        for next in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if seen < workflow.nodes.len() {
        let mut cyclic: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| (*id).to_string())
            .collect();
        cyclic.sort();
        errors.push(ValidationError::CycleDetected { node_ids: cyclic });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CoreCatalog;
    use crate::variables::{VariableDef, VariableType};

    fn linear() -> Workflow {
        Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "end", "exec_in"))
    }

    #[test]
    fn test_valid_linear_workflow() {
        let errors = validate_workflow(&linear(), &CoreCatalog);
        assert!(errors.is_empty(), "unexpected offenses: {:?}", errors);
    }

    #[test]
    fn test_missing_start() {
        let wf = Workflow::new("wf", "Test").with_node(NodeRecord::new("end", "End"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors.contains(&ValidationError::MissingStartNode));
    }

    #[test]
    fn test_unreachable_node() {
        let wf = linear().with_node(NodeRecord::new("island", "Merge"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnreachableNode { node_id } if node_id == "island")));
    }

    #[test]
    fn test_floating_comment_allowed() {
        let wf = linear().with_node(NodeRecord::new("note", "Comment"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors.is_empty(), "unexpected offenses: {:?}", errors);
    }

    #[test]
    fn test_exec_fan_out_rejected_for_plain_nodes() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("m", "Merge"))
            .with_node(NodeRecord::new("a", "End"))
            .with_node(NodeRecord::new("b", "End"))
            .with_connection(Connection::new("start", "exec_out", "m", "exec_in"))
            .with_connection(Connection::new("m", "exec_out", "a", "exec_in"))
            .with_connection(Connection::new("m", "exec_out", "b", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::ExecFanOut { node_id, .. } if node_id == "m")));
    }

    #[test]
    fn test_start_may_fan_out() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("a", "End"))
            .with_node(NodeRecord::new("b", "End"))
            .with_connection(Connection::new("start", "exec_out", "a", "exec_in"))
            .with_connection(Connection::new("start", "exec_out", "b", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors.is_empty(), "unexpected offenses: {:?}", errors);
    }

    #[test]
    fn test_unpaired_loop_start() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("loop", "ForLoopStart"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "loop", "exec_in"))
            .with_connection(Connection::new("loop", "completed", "end", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnpairedLoop { node_id } if node_id == "loop")));
    }

    #[test]
    fn test_paired_loop_is_valid_and_acyclic() {
        let wf = loop_workflow();
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors.is_empty(), "unexpected offenses: {:?}", errors);
    }

    fn loop_workflow() -> Workflow {
        Workflow::new("wf", "Loop")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("ls", "ForLoopStart")
                    .with_config("items", serde_json::json!([1, 2])),
            )
            .with_node(NodeRecord::new("body", "Comment"))
            .with_node(NodeRecord::new("le", "ForLoopEnd"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "ls", "exec_in"))
            .with_connection(Connection::new("ls", "body", "body", "exec_in"))
            .with_connection(Connection::new("body", "exec_out", "le", "exec_in"))
            .with_connection(Connection::new("le", "loop", "ls", "loop"))
            .with_connection(Connection::new("ls", "completed", "end", "exec_in"))
    }

    #[test]
    fn test_break_outside_loop() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("br", "Break"))
            .with_connection(Connection::new("start", "exec_out", "br", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::OrphanLoopSignal { node_id } if node_id == "br")));
    }

    #[test]
    fn test_break_inside_loop_accepted() {
        let wf = loop_workflow()
            .with_node(NodeRecord::new("br", "Break"))
            .with_connection(Connection::new("body", "exec_out", "br", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        // `body` now fans out, which is a separate offense; the break itself
        // must not be flagged
        assert!(!errors
            .iter()
            .any(|e| matches!(e, ValidationError::OrphanLoopSignal { .. })));
    }

    #[test]
    fn test_cycle_detection() {
        let wf = Workflow::new("wf", "Test")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("a", "Merge"))
            .with_node(NodeRecord::new("b", "Merge"))
            .with_connection(Connection::new("start", "exec_out", "a", "exec_in"))
            .with_connection(Connection::new("a", "exec_out", "b", "exec_in"))
            .with_connection(Connection::new("b", "exec_out", "a", "exec_in"));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::CycleDetected { .. })));
    }

    #[test]
    fn test_duplicate_and_invalid_variables() {
        let wf = linear()
            .with_variable(VariableDef::new("x", VariableType::Integer, 1.into()))
            .with_variable(VariableDef::new("x", VariableType::Integer, 2.into()))
            .with_variable(VariableDef::new("9bad", VariableType::String, "v".into()));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateVariable { name } if name == "x")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidIdentifier { name } if name == "9bad")));
    }

    #[test]
    fn test_dangerous_pattern() {
        let wf = linear().with_node(
            NodeRecord::new("island", "Comment")
                .with_config("note", serde_json::json!("import subprocess")),
        );
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DangerousPattern { pattern, .. } if pattern == "subprocess")));
    }

    #[test]
    fn test_zero_range_step() {
        let wf = loop_workflow();
        let mut wf = wf;
        let node = wf.nodes.get_mut("ls").unwrap();
        node.config.insert("mode".into(), serde_json::json!("range"));
        node.config.insert("step".into(), serde_json::json!(0));
        let errors = validate_workflow(&wf, &CoreCatalog);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::ZeroLoopStep { node_id } if node_id == "ls")));
    }
}
