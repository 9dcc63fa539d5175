//! Execution DAG for Sluice workflows
//!
//! Nodes are step instances (forward steps and instantiated auxiliary rules);
//! edges run producer to consumer. Unlike a build-once graph the DAG grows
//! during execution: resolving a `depends` target may add auxiliary nodes and
//! edges mid-run. Cycle detection happens at edge insertion so a cyclic
//! dependency fails before any action runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use sl_workflow::Step;

mod resolver;

pub use resolver::{Production, Resolver};

/// DAG-related errors
#[derive(Debug, Error)]
pub enum DagError {
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),
}

impl From<DagError> for sl_core::Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected(path) => sl_core::Error::CyclicDependency { path },
            DagError::NodeNotFound(node) => sl_core::Error::Validation {
                step: node,
                message: "not part of the execution DAG".to_string(),
            },
        }
    }
}

/// Node execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Resolving,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped
        )
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Skipped)
    }
}

/// A step instance in the DAG: the step plus the parameter context bound when
/// an auxiliary rule's `provides` pattern matched a requested target
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub step: Step,
    pub bound: BTreeMap<String, String>,
    /// Concrete target name an auxiliary rule was instantiated for
    pub aux_target: Option<String>,
    pub state: NodeState,
}

impl Node {
    /// Node for a forward step
    pub fn forward(step: Step) -> Self {
        Self {
            id: step.display_name(),
            step,
            bound: BTreeMap::new(),
            aux_target: None,
            state: NodeState::Pending,
        }
    }

    /// Node for an auxiliary rule instantiated against a target name
    pub fn auxiliary(step: Step, target_name: &str, bound: BTreeMap<String, String>) -> Self {
        Self {
            id: format!("{}:{}", step.display_name(), target_name),
            step,
            bound,
            aux_target: Some(target_name.to_string()),
            state: NodeState::Pending,
        }
    }
}

/// The execution DAG, mutated only by the scheduler
#[derive(Debug, Default)]
pub struct ExecutionDag {
    nodes: HashMap<String, Node>,
    /// producer -> consumers
    children: HashMap<String, Vec<String>>,
    /// consumer -> producers
    parents: HashMap<String, Vec<String>>,
    /// insertion order, for deterministic iteration
    order: Vec<String>,
}

impl ExecutionDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node if absent; returns whether it was newly added
    #[instrument(skip(self, node), fields(node = %node.id))]
    pub fn add_node(&mut self, node: Node) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        debug!("Added node");
        self.children.insert(node.id.clone(), Vec::new());
        self.parents.insert(node.id.clone(), Vec::new());
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        true
    }

    /// Insert a producer -> consumer edge, rejecting edges that close a cycle
    #[instrument(skip(self))]
    pub fn add_edge(&mut self, producer: &str, consumer: &str) -> Result<(), DagError> {
        if !self.nodes.contains_key(producer) {
            return Err(DagError::NodeNotFound(producer.to_string()));
        }
        if !self.nodes.contains_key(consumer) {
            return Err(DagError::NodeNotFound(consumer.to_string()));
        }
        if producer == consumer {
            return Err(DagError::CycleDetected(format!(
                "{} -> {}",
                producer, consumer
            )));
        }
        if self
            .children
            .get(producer)
            .is_some_and(|c| c.iter().any(|c| c.as_str() == consumer))
        {
            return Ok(());
        }
        // the new edge closes a cycle iff the producer is already reachable
        // from the consumer
        if let Some(path) = self.find_path(consumer, producer) {
            let mut cycle = path.join(" -> ");
            cycle.push_str(&format!(" -> {}", consumer));
            warn!(cycle = %cycle, "Rejected edge");
            return Err(DagError::CycleDetected(cycle));
        }
        self.children
            .get_mut(producer)
            .expect("checked above")
            .push(consumer.to_string());
        self.parents
            .get_mut(consumer)
            .expect("checked above")
            .push(producer.to_string());
        debug!("Added edge");
        Ok(())
    }

    /// Directed path from `from` to `to`, if one exists
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut visited = HashSet::new();
        while let Some(path) = stack.pop() {
            let last = path.last().expect("paths are non-empty");
            if last == to {
                return Some(path);
            }
            if !visited.insert(last.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(last) {
                for child in children {
                    let mut next = path.clone();
                    next.push(child.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    pub fn set_state(&mut self, id: &str, state: NodeState) -> Result<(), DagError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| DagError::NodeNotFound(id.to_string()))?;
        debug!(node = %id, from = ?node.state, to = ?state, "Node state change");
        node.state = state;
        Ok(())
    }

    /// Node ids in insertion order
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Pending nodes whose producers have all finished successfully
    pub fn ready_nodes(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.nodes[*id].state == NodeState::Pending
                    && self
                        .parents(id.as_str())
                        .iter()
                        .all(|p| self.nodes[p].state.is_successful())
            })
            .cloned()
            .collect()
    }

    /// Whether every node has reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    pub fn has_failed(&self) -> bool {
        self.nodes.values().any(|n| n.state == NodeState::Failed)
    }

    /// Mark every transitive consumer of a failed node skipped
    pub fn skip_dependents(&mut self, failed: &str) {
        let mut queue = vec![failed.to_string()];
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            for child in self.children(&id).to_vec() {
                if let Some(node) = self.nodes.get_mut(&child) {
                    if matches!(node.state, NodeState::Pending | NodeState::Ready) {
                        node.state = NodeState::Skipped;
                        debug!(node = %child, "Skipped dependent of failed node");
                    }
                }
                queue.push(child);
            }
        }
    }

    /// Per-state node counts
    pub fn status_summary(&self) -> HashMap<NodeState, usize> {
        let mut summary = HashMap::new();
        for node in self.nodes.values() {
            *summary.entry(node.state).or_insert(0) += 1;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
