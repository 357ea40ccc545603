//! Dependency graph over resource declarations.
//!
//! Edges are inferred from output references in property maps ("subnet
//! references network id") and from explicit `depends_on` entries. Every
//! edge points from producer to consumer. The graph must be acyclic; a
//! cycle is a fatal configuration error reported with an implicated path.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::decl::{DeclarationSet, PropValue, ResourceDeclaration};
use crate::state::ResourceState;

/// Errors building the dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
  /// Two declarations share a logical name.
  #[error("duplicate resource name: {0}")]
  DuplicateName(String),

  /// A logical name is empty or not usable as a state file name.
  #[error("invalid resource name: {0:?}")]
  InvalidName(String),

  /// A reference names a logical name not present in the declaration set.
  #[error("unresolved reference from '{from}' to unknown resource '{to}'")]
  UnresolvedReference { from: String, to: String },

  /// The reference graph contains a cycle.
  #[error("dependency cycle detected: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },
}

/// A DAG of logical resource names.
pub struct ResourceGraph {
  graph: DiGraph<String, ()>,
  nodes: BTreeMap<String, NodeIndex>,
}

impl ResourceGraph {
  /// Build the graph for a declaration set.
  ///
  /// # Errors
  ///
  /// `InvalidName` for names unusable as state file names, `DuplicateName`
  /// for repeated logical names, `UnresolvedReference` for references to
  /// names outside the set, and `Cycle` (carrying one implicated cycle
  /// path) if the resulting graph is not acyclic.
  pub fn from_declarations(decls: &DeclarationSet) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes: BTreeMap<String, NodeIndex> = BTreeMap::new();

    for decl in &decls.resources {
      if !is_valid_name(&decl.name) {
        return Err(GraphError::InvalidName(decl.name.clone()));
      }
      if nodes.contains_key(&decl.name) {
        return Err(GraphError::DuplicateName(decl.name.clone()));
      }
      let idx = graph.add_node(decl.name.clone());
      nodes.insert(decl.name.clone(), idx);
    }

    for decl in &decls.resources {
      let consumer = nodes[&decl.name];
      for target in referenced_names(decl) {
        let Some(&producer) = nodes.get(&target) else {
          return Err(GraphError::UnresolvedReference {
            from: decl.name.clone(),
            to: target,
          });
        };
        graph.update_edge(producer, consumer, ());
      }
    }

    let resource_graph = Self { graph, nodes };
    resource_graph.verify_acyclic()?;
    Ok(resource_graph)
  }

  /// Build a graph from persisted state records.
  ///
  /// Used for delete ordering. References to names without a state record
  /// are skipped rather than rejected: the referenced resource may have
  /// been deleted by an earlier run.
  pub fn from_state(state: &BTreeMap<String, ResourceState>) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes: BTreeMap<String, NodeIndex> = BTreeMap::new();

    for name in state.keys() {
      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);
    }

    for (name, record) in state {
      let consumer = nodes[name];
      let mut targets: BTreeSet<String> = record
        .props
        .values()
        .filter_map(|v| v.referenced_resource().map(str::to_string))
        .collect();
      targets.extend(record.depends_on.iter().cloned());

      for target in targets {
        if target == *name {
          continue;
        }
        if let Some(&producer) = nodes.get(&target) {
          graph.update_edge(producer, consumer, ());
        }
      }
    }

    Self { graph, nodes }
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    if toposort(&self.graph, None).is_err() {
      let path = self.find_cycle().unwrap_or_default();
      return Err(GraphError::Cycle { path });
    }
    Ok(())
  }

  /// Find one cycle path via DFS with a recursion-stack marker.
  fn find_cycle(&self) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Visiting,
      Done,
    }

    fn visit(
      graph: &DiGraph<String, ()>,
      node: NodeIndex,
      marks: &mut HashMap<NodeIndex, Mark>,
      stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
      marks.insert(node, Mark::Visiting);
      stack.push(node);

      for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match marks.get(&next) {
          None => {
            if let Some(cycle) = visit(graph, next, marks, stack) {
              return Some(cycle);
            }
          }
          Some(Mark::Visiting) => {
            let start = stack.iter().position(|&n| n == next).unwrap_or(0);
            let mut cycle = stack[start..].to_vec();
            cycle.push(next);
            return Some(cycle);
          }
          Some(Mark::Done) => {}
        }
      }

      stack.pop();
      marks.insert(node, Mark::Done);
      None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for &idx in self.nodes.values() {
      if marks.contains_key(&idx) {
        continue;
      }
      if let Some(cycle) = visit(&self.graph, idx, &mut marks, &mut stack) {
        return Some(cycle.into_iter().map(|i| self.graph[i].clone()).collect());
      }
    }
    None
  }

  /// Names in an order where every producer precedes its consumers.
  ///
  /// Deterministic: Kahn's algorithm with the ready set ordered by logical
  /// name, so identical inputs always yield identical orders. On a graph
  /// that was built leniently and turns out cyclic, nodes on the cycle are
  /// appended in name order.
  pub fn topological_order(&self) -> Vec<String> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|i| (i, self.graph.neighbors_directed(i, Direction::Incoming).count()))
      .collect();

    let mut ready: BTreeSet<String> = self
      .nodes
      .iter()
      .filter(|(_, &idx)| in_degree[&idx] == 0)
      .map(|(name, _)| name.clone())
      .collect();

    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(name) = ready.pop_first() {
      let idx = self.nodes[&name];
      order.push(name);

      for consumer in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(deg) = in_degree.get_mut(&consumer) {
          *deg = deg.saturating_sub(1);
          if *deg == 0 {
            ready.insert(self.graph[consumer].clone());
          }
        }
      }
    }

    if order.len() < self.nodes.len() {
      for name in self.nodes.keys() {
        if !order.contains(name) {
          order.push(name.clone());
        }
      }
    }

    order
  }

  /// Names grouped into waves of mutually independent resources.
  ///
  /// All dependencies of a wave-`k` resource are in waves `0..k`, so each
  /// wave may be dispatched concurrently. Waves are name-sorted.
  pub fn execution_waves(&self) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|i| (i, self.graph.neighbors_directed(i, Direction::Incoming).count()))
      .collect();

    let mut remaining: BTreeSet<String> = self.nodes.keys().cloned().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let wave: Vec<String> = remaining
        .iter()
        .filter(|name| in_degree[&self.nodes[name.as_str()]] == 0)
        .cloned()
        .collect();

      if wave.is_empty() {
        // Cycle remainder (lenient state graphs only): one final wave.
        waves.push(std::mem::take(&mut remaining).into_iter().collect());
        break;
      }

      for name in &wave {
        remaining.remove(name);
        let idx = self.nodes[name];
        for consumer in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&consumer) {
            *deg = deg.saturating_sub(1);
          }
        }
        in_degree.insert(idx, usize::MAX);
      }

      waves.push(wave);
    }

    waves
  }

  /// Direct dependencies (producers) of a resource, name-sorted.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    self.neighbor_names(name, Direction::Incoming)
  }

  /// Direct dependents (consumers) of a resource, name-sorted.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    self.neighbor_names(name, Direction::Outgoing)
  }

  fn neighbor_names(&self, name: &str, direction: Direction) -> Vec<String> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    let mut names: Vec<String> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|i| self.graph[i].clone())
      .collect();
    names.sort();
    names
  }

  /// Returns true if the graph has a node for the given name.
  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  /// Number of resources in the graph.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  /// Returns true if the graph is empty.
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

/// Logical names double as state file names, so they must be plain
/// single-component file names.
fn is_valid_name(name: &str) -> bool {
  !name.is_empty()
    && name != "."
    && name != ".."
    && !name.contains(['/', '\\'])
    && !name.contains(char::is_whitespace)
}

/// Names a declaration depends on: reference targets plus `depends_on`.
fn referenced_names(decl: &ResourceDeclaration) -> BTreeSet<String> {
  let mut names: BTreeSet<String> = decl
    .props
    .values()
    .filter_map(|v| v.referenced_resource().map(str::to_string))
    .collect();
  names.extend(decl.depends_on.iter().cloned());
  names
}
