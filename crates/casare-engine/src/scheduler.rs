//! Workflow compilation
//!
//! A workflow is compiled once into an [`ExecutionPlan`]: per-node flat
//! edge vectors, control-flow pairings, retry policies and topological
//! levels over the planning graph (the graph without loop back-edges and
//! try fallback edges). Plans are cached by workflow content hash and
//! shared read-only between runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use casare_workflow::{
    check_workflow, planning_edges, CoreNodeKind, NodeId, NodePorts, Pairing, PortCatalog,
    PortDataType, PortName, Workflow,
};

use crate::error::{EngineError, Result};
use crate::registry::NodeRegistry;
use crate::resources::ResourceKind;
use crate::retry::RetryPolicy;

/// How the executor treats a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// Dispatched through the registry with retry/breaker wrapping
    Opaque,
    /// Interpreted inline by the control-flow engine
    Control,
    /// Forwarded without execution or events (Comment, Reroute)
    Noop,
}

/// One resolved data edge into a node input
#[derive(Debug, Clone)]
pub struct DataEdgeRef {
    pub input_port: PortName,
    pub source_node: NodeId,
    pub source_port: PortName,
    /// Declared type of the receiving port, checked at traversal time
    pub target_type: PortDataType,
}

/// Everything the executor needs to know about one node
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub id: NodeId,
    pub type_name: String,
    pub kind: CoreNodeKind,
    pub class: NodeClass,
    pub ports: NodePorts,
    /// Incoming data edges (upstream)
    pub data_inputs: Vec<DataEdgeRef>,
    /// All outgoing execution edges as `(output port, target node)`,
    /// including loop back-edges and try fallback edges
    pub exec_targets: Vec<(PortName, NodeId)>,
    /// Execution output ports in declaration order
    pub exec_out_order: Vec<PortName>,
    pub retry: RetryPolicy,
    pub resources: Vec<ResourceKind>,
    pub cpu_bound: bool,
    /// Paired loop end (on loop starts)
    pub loop_end: Option<NodeId>,
    /// Paired loop start (on loop ends)
    pub loop_start: Option<NodeId>,
    /// Paired Catch (on Try nodes)
    pub catch_node: Option<NodeId>,
    /// Paired Finally (on Try nodes)
    pub finally_node: Option<NodeId>,
    /// Topological level in the planning graph
    pub level: usize,
}

impl NodePlan {
    /// Targets of one execution output port, in edge order
    pub fn targets_of<'a>(&'a self, port: &'a str) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.exec_targets
            .iter()
            .filter(move |(p, _)| p == port)
            .map(|(_, target)| target)
    }
}

/// A compiled, immutable execution plan
#[derive(Debug)]
pub struct ExecutionPlan {
    pub workflow: Arc<Workflow>,
    pub nodes: HashMap<NodeId, NodePlan>,
    /// Nodes grouped by topological level; same-level nodes are mutually
    /// independent in the planning graph
    pub levels: Vec<Vec<NodeId>>,
    pub start: NodeId,
    /// Distinct resource kinds any node declares, for run-start reservation
    pub reserved_kinds: Vec<ResourceKind>,
}

impl ExecutionPlan {
    pub fn node(&self, id: &str) -> Result<&NodePlan> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::internal(format!("plan has no node '{}'", id)))
    }

    /// Whether any node borrows a browser (lowers effective parallelism)
    pub fn uses_browser(&self) -> bool {
        self.reserved_kinds.contains(&ResourceKind::Browser)
    }
}

/// Compile a workflow against the registry.
///
/// Runs the full validator first; compilation itself cannot fail on a
/// valid workflow.
pub fn compile(workflow: Arc<Workflow>, registry: &NodeRegistry) -> Result<Arc<ExecutionPlan>> {
    check_workflow(&workflow, registry)?;

    // Pairings were already validated; recompute without collecting offenses
    let mut scratch = Vec::new();
    let pairing = Pairing::compute(&workflow, &mut scratch);

    let mut nodes = HashMap::with_capacity(workflow.nodes.len());
    let mut start = None;
    let mut reserved_kinds: Vec<ResourceKind> = Vec::new();

    for (id, record) in &workflow.nodes {
        let kind = record.kind();
        let ports = registry
            .ports(record)
            .ok_or_else(|| EngineError::UnknownNodeType {
                type_name: record.type_name.clone(),
            })?;

        let class = if kind.is_noop() {
            NodeClass::Noop
        } else if kind.is_control() {
            NodeClass::Control
        } else {
            NodeClass::Opaque
        };

        let mut data_inputs = Vec::new();
        for conn in workflow.incoming(id) {
            let Some(def) = ports.input(&conn.target_port) else {
                continue;
            };
            if !def.data_type.is_execution() {
                data_inputs.push(DataEdgeRef {
                    input_port: conn.target_port.clone(),
                    source_node: conn.source_node.clone(),
                    source_port: conn.source_port.clone(),
                    target_type: def.data_type,
                });
            }
        }

        let exec_out_order: Vec<PortName> = ports
            .exec_outputs()
            .iter()
            .map(|p| (*p).to_string())
            .collect();
        let mut exec_targets = Vec::new();
        for port in &exec_out_order {
            for conn in workflow.outgoing_from_port(id, port) {
                exec_targets.push((port.clone(), conn.target_node.clone()));
            }
        }

        let (resources, cpu_bound, base_retry) = if class == NodeClass::Opaque {
            let meta = registry.metadata(&record.type_name)?;
            (meta.resources, meta.cpu_bound, meta.retry)
        } else {
            (Vec::new(), false, RetryPolicy::default())
        };
        for kind in &resources {
            if !reserved_kinds.contains(kind) {
                reserved_kinds.push(*kind);
            }
        }

        if kind == CoreNodeKind::Start {
            start = Some(id.clone());
        }

        nodes.insert(
            id.clone(),
            NodePlan {
                id: id.clone(),
                type_name: record.type_name.clone(),
                kind,
                class,
                ports,
                data_inputs,
                exec_targets,
                exec_out_order,
                retry: RetryPolicy::from_config(&base_retry, &record.config),
                resources,
                cpu_bound,
                loop_end: pairing.loop_end_of.get(id).cloned(),
                loop_start: pairing.loop_start_of.get(id).cloned(),
                catch_node: pairing.catch_of.get(id).cloned(),
                finally_node: pairing.finally_of.get(id).cloned(),
                level: 0,
            },
        );
    }

    let start = start.ok_or_else(|| EngineError::internal("validated workflow lost its Start"))?;
    let levels = assign_levels(&workflow, &mut nodes);

    Ok(Arc::new(ExecutionPlan {
        workflow,
        nodes,
        levels,
        start,
        reserved_kinds,
    }))
}

/// Kahn's algorithm over the planning graph, assigning each node the
/// length of its longest dependency chain as its level
fn assign_levels(workflow: &Workflow, nodes: &mut HashMap<NodeId, NodePlan>) -> Vec<Vec<NodeId>> {
    let edges = planning_edges(workflow);
    let mut in_degree: HashMap<&str, usize> =
        workflow.nodes.keys().map(|id| (id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &edges {
        successors
            .entry(conn.source_node.as_str())
            .or_default()
            .push(conn.target_node.as_str());
        if let Some(d) = in_degree.get_mut(conn.target_node.as_str()) {
            *d += 1;
        }
    }

    let mut level_of: HashMap<&str, usize> = HashMap::new();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    for id in &queue {
        level_of.insert(*id, 0);
    }

    while let Some(current) = queue.pop_front() {
        let current_level = level_of.get(current).copied().unwrap_or(0);
        for next in successors.get(current).into_iter().flatten() {
            let entry = level_of.entry(next).or_insert(0);
            *entry = (*entry).max(current_level + 1);
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    let max_level = level_of.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<NodeId>> = vec![Vec::new(); max_level + 1];
    for (id, level) in &level_of {
        levels[*level].push((*id).to_string());
        if let Some(plan) = nodes.get_mut(*id) {
            plan.level = *level;
        }
    }
    for level in &mut levels {
        level.sort();
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use casare_workflow::{Connection, NodeRecord};

    fn registry() -> NodeRegistry {
        NodeRegistry::new()
    }

    fn diamond() -> Workflow {
        Workflow::new("wf", "Diamond")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("a", "Merge"))
            .with_node(NodeRecord::new("b", "Merge"))
            .with_node(NodeRecord::new("join", "Merge"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "a", "exec_in"))
            .with_connection(Connection::new("start", "exec_out", "b", "exec_in"))
            .with_connection(Connection::new("a", "exec_out", "join", "exec_in"))
            .with_connection(Connection::new("b", "exec_out", "join", "exec_in"))
            .with_connection(Connection::new("join", "exec_out", "end", "exec_in"))
    }

    #[test]
    fn test_levels_of_diamond() {
        let plan = compile(Arc::new(diamond()), &registry()).unwrap();
        assert_eq!(plan.nodes["start"].level, 0);
        assert_eq!(plan.nodes["a"].level, 1);
        assert_eq!(plan.nodes["b"].level, 1);
        assert_eq!(plan.nodes["join"].level, 2);
        assert_eq!(plan.nodes["end"].level, 3);
        assert_eq!(plan.levels[1], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_start_targets_in_order(){
        let plan = compile(Arc::new(diamond()), &registry()).unwrap();
        let start = plan.node("start").unwrap();
        let targets: Vec<&NodeId> = start.targets_of("exec_out").collect();
        assert_eq!(targets, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_type_fails_compile() {
        let wf = Workflow::new("wf", "Bad")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(NodeRecord::new("x", "not-registered"))
            .with_connection(Connection::new("start", "exec_out", "x", "exec_in"));
        let err = compile(Arc::new(wf), &registry()).unwrap_err();
        assert!(matches!(err, EngineError::WorkflowValidation { .. }));
    }

    #[test]
    fn test_loop_pairing_in_plan() {
        let wf = Workflow::new("wf", "Loop")
            .with_node(NodeRecord::new("start", "Start"))
            .with_node(
                NodeRecord::new("ls", "ForLoopStart")
                    .with_config("items", serde_json::json!([1])),
            )
            .with_node(NodeRecord::new("le", "ForLoopEnd"))
            .with_node(NodeRecord::new("end", "End"))
            .with_connection(Connection::new("start", "exec_out", "ls", "exec_in"))
            .with_connection(Connection::new("ls", "body", "le", "exec_in"))
            .with_connection(Connection::new("le", "loop", "ls", "loop"))
            .with_connection(Connection::new("ls", "completed", "end", "exec_in"));
        let plan = compile(Arc::new(wf), &registry()).unwrap();
        assert_eq!(plan.nodes["ls"].loop_end.as_deref(), Some("le"));
        assert_eq!(plan.nodes["le"].loop_start.as_deref(), Some("ls"));
    }
}
