//! The operation graph: an append-only, content-addressed DAG of build steps.
//!
//! Adding a node never executes anything. Nodes are deduplicated by
//! fingerprint, so describing the same step twice (same operation, same
//! parameters, same dependencies) yields the same [`NodeRef`]. A node can
//! only reference nodes that already exist, which keeps the graph acyclic
//! without any cycle check.

mod types;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::trace;

use crate::util::hash::{Fingerprint, Hashable};

pub use types::{
  GraphError, GraphId, NodeRef, NodeSummary, Operation, OperationKind, OperationNode, OutputKind,
};
pub(crate) use types::NodeIdentity;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

struct GraphInner {
  /// Edges point from dependency to dependent; the weight is the position
  /// of the dependency in the dependent's list.
  graph: DiGraph<OperationNode, usize>,
  by_fingerprint: HashMap<Fingerprint, NodeIndex>,
}

pub struct OperationGraph {
  id: GraphId,
  inner: RwLock<GraphInner>,
}

impl Default for OperationGraph {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for OperationGraph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OperationGraph")
      .field("id", &self.id)
      .field("len", &self.len())
      .finish()
  }
}

impl OperationGraph {
  pub fn new() -> Self {
    Self {
      id: GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed)),
      inner: RwLock::new(GraphInner {
        graph: DiGraph::new(),
        by_fingerprint: HashMap::new(),
      }),
    }
  }

  pub fn id(&self) -> GraphId {
    self.id
  }

  pub fn len(&self) -> usize {
    self.inner.read().graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Describe a step. Pure and deterministic.
  ///
  /// # Errors
  ///
  /// - `InvalidReference` if a dependency was not produced by this graph or
  ///   is a terminal (publish) node.
  /// - `InvalidOperation` if the parameters are malformed or the
  ///   dependencies do not have the arity and output kinds the operation
  ///   expects.
  pub fn add_node(&self, op: Operation, deps: &[NodeRef]) -> Result<NodeRef, GraphError> {
    let kind = op.kind();
    op.validate()
      .map_err(|message| GraphError::InvalidOperation { kind, message })?;

    let expected = op.inputs();
    if expected.len() != deps.len() {
      return Err(GraphError::InvalidOperation {
        kind,
        message: format!("expected {} dependencies, got {}", expected.len(), deps.len()),
      });
    }

    let fingerprint = NodeIdentity {
      op: &op,
      deps: deps.iter().map(|d| &d.fingerprint).collect(),
    }
    .fingerprint()
    .map_err(|e| GraphError::Fingerprint(e.to_string()))?;

    let mut inner = self.inner.write();

    for (position, (dep, want)) in deps.iter().zip(expected).enumerate() {
      let dep_node = self.lookup(&inner, dep)?;
      if dep_node.op.is_terminal() {
        return Err(GraphError::InvalidReference(format!(
          "{} node {} is terminal and cannot be used as an input",
          dep_node.op.kind(),
          dep
        )));
      }
      let got = dep_node.op.output();
      if got != *want {
        return Err(GraphError::InvalidOperation {
          kind,
          message: format!("dependency {} must be a {}, got a {}", position, want, got),
        });
      }
    }

    if let Some(&index) = inner.by_fingerprint.get(&fingerprint) {
      return Ok(NodeRef {
        graph: self.id,
        index,
        fingerprint,
      });
    }

    let index = inner.graph.add_node(OperationNode {
      op,
      deps: deps.to_vec(),
      fingerprint: fingerprint.clone(),
    });
    for (position, dep) in deps.iter().enumerate() {
      inner.graph.add_edge(dep.index, index, position);
    }
    inner.by_fingerprint.insert(fingerprint.clone(), index);

    trace!(node = index.index(), fingerprint = %fingerprint, op = %kind, "node added");

    Ok(NodeRef {
      graph: self.id,
      index,
      fingerprint,
    })
  }

  fn lookup<'a>(&self, inner: &'a GraphInner, node: &NodeRef) -> Result<&'a OperationNode, GraphError> {
    if node.graph != self.id {
      return Err(GraphError::InvalidReference(format!(
        "node {} belongs to a different graph",
        node
      )));
    }
    match inner.graph.node_weight(node.index) {
      Some(weight) if weight.fingerprint == node.fingerprint => Ok(weight),
      Some(_) => Err(GraphError::InvalidReference(format!(
        "node {} does not match the node stored at its index",
        node
      ))),
      None => Err(GraphError::InvalidReference(format!("node {} does not exist", node))),
    }
  }

  /// Check that `node` was produced by this graph.
  pub fn check(&self, node: &NodeRef) -> Result<(), GraphError> {
    let inner = self.inner.read();
    self.lookup(&inner, node).map(|_| ())
  }

  pub fn node(&self, node: &NodeRef) -> Result<OperationNode, GraphError> {
    let inner = self.inner.read();
    self.lookup(&inner, node).cloned()
  }

  /// Look up a node by fingerprint.
  pub fn find(&self, fingerprint: &Fingerprint) -> Option<NodeRef> {
    let inner = self.inner.read();
    inner.by_fingerprint.get(fingerprint).map(|&index| NodeRef {
      graph: self.id,
      index,
      fingerprint: fingerprint.clone(),
    })
  }

  /// Direct dependencies of `node`, in declared order.
  pub fn dependencies(&self, node: &NodeRef) -> Result<Vec<NodeRef>, GraphError> {
    Ok(self.node(node)?.deps)
  }

  /// Nodes that consume `node` directly.
  pub fn dependents(&self, node: &NodeRef) -> Result<Vec<NodeRef>, GraphError> {
    let inner = self.inner.read();
    self.lookup(&inner, node)?;
    let mut out: Vec<NodeRef> = inner
      .graph
      .neighbors_directed(node.index, Direction::Outgoing)
      .collect::<HashSet<_>>()
      .into_iter()
      .map(|index| NodeRef {
        graph: self.id,
        index,
        fingerprint: inner.graph[index].fingerprint.clone(),
      })
      .collect();
    out.sort_by_key(|n| n.index);
    Ok(out)
  }

  /// All nodes reachable from `root`, dependencies before dependents,
  /// siblings in declared order.
  pub fn subgraph(&self, root: &NodeRef) -> Result<Vec<NodeRef>, GraphError> {
    let inner = self.inner.read();
    self.lookup(&inner, root)?;

    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (node, expanded): a node is emitted on its second visit, after its deps.
    let mut stack = vec![(root.index, false)];

    while let Some((index, expanded)) = stack.pop() {
      if expanded {
        order.push(NodeRef {
          graph: self.id,
          index,
          fingerprint: inner.graph[index].fingerprint.clone(),
        });
        continue;
      }
      if !visited.insert(index) {
        continue;
      }
      stack.push((index, true));
      for dep in inner.graph[index].deps.iter().rev() {
        if !visited.contains(&dep.index) {
          stack.push((dep.index, false));
        }
      }
    }

    Ok(order)
  }

  /// The subgraph under `root` organized into parallel execution waves.
  ///
  /// Every node's dependencies sit in earlier waves, so the members of one
  /// wave are independent of each other.
  pub fn waves(&self, root: &NodeRef) -> Result<Vec<Vec<NodeRef>>, GraphError> {
    let nodes = self.subgraph(root)?;
    let inner = self.inner.read();
    let members: HashSet<NodeIndex> = nodes.iter().map(|n| n.index).collect();

    // Kahn's algorithm, level by level.
    let mut in_degree: HashMap<NodeIndex, usize> = nodes
      .iter()
      .map(|n| {
        let distinct: HashSet<NodeIndex> = inner.graph[n.index].deps.iter().map(|d| d.index).collect();
        (n.index, distinct.len())
      })
      .collect();

    let mut waves = Vec::new();
    let mut remaining: Vec<NodeRef> = nodes;

    while !remaining.is_empty() {
      let (ready, rest): (Vec<NodeRef>, Vec<NodeRef>) =
        remaining.into_iter().partition(|n| in_degree[&n.index] == 0);

      for node in &ready {
        let dependents: HashSet<NodeIndex> = inner
          .graph
          .neighbors_directed(node.index, Direction::Outgoing)
          .filter(|idx| members.contains(idx))
          .collect();
        for dependent in dependents {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      waves.push(ready);
      remaining = rest;
    }

    Ok(waves)
  }
}
