//! Execution planning: run this before executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `from` and `to`).
//! 3. The directed graph must be acyclic.
//!
//! The resulting order is deterministic: among nodes that are ready at the
//! same time, the one declared first runs first.

use std::collections::{BTreeSet, HashMap};

use crate::{EngineError, models::Workflow};

/// One node in execution order, with the nodes feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub id: String,
    /// Upstream node IDs in edge declaration order. Empty for entry nodes.
    pub parents: Vec<String>,
}

impl PlannedNode {
    pub fn is_entry(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Validated, topologically sorted workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub steps: Vec<PlannedNode>,
}

impl ExecutionPlan {
    /// Node IDs in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Validate the workflow's graph and return its execution plan.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn plan(workflow: &Workflow) -> Result<ExecutionPlan, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(workflow.nodes.len());
    for (position, node) in workflow.nodes.iter().enumerate() {
        if index.insert(node.id.as_str(), position).is_some() {
            return Err(EngineError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); workflow.nodes.len()];
    let mut parents: Vec<Vec<String>> = vec![Vec::new(); workflow.nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; workflow.nodes.len()];

    for edge in &workflow.edges {
        let from = *index.get(edge.from.as_str()).ok_or_else(|| {
            EngineError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            }
        })?;
        let to = *index.get(edge.to.as_str()).ok_or_else(|| {
            EngineError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            }
        })?;

        children[from].push(to);
        parents[to].push(edge.from.clone());
        in_degree[to] += 1;
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm, lowest declaration index first)
    // -----------------------------------------------------------------------
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(position, _)| position)
        .collect();

    let mut steps = Vec::with_capacity(workflow.nodes.len());
    while let Some(position) = ready.pop_first() {
        steps.push(PlannedNode {
            id: workflow.nodes[position].id.clone(),
            parents: std::mem::take(&mut parents[position]),
        });

        for &child in &children[position] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if steps.len() != workflow.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(ExecutionPlan { steps })
}
