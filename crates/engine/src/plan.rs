//! Plan construction.
//!
//! A plan is an ordered operation list derived from the diff: deletions
//! first, in reverse dependency order over the persisted state graph
//! (dependents before their dependencies), then creates and updates in
//! topological order of the declared graph. Resources without a relative
//! ordering constraint tie-break by logical name, so identical inputs
//! always produce identical plans.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::diff::StateDiff;
use crate::graph::ResourceGraph;
use crate::state::ResourceState;

/// The kind of change a plan operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
  Create,
  Update,
  Delete,
}

impl OpKind {
  /// Symbol used in plan rendering.
  pub fn symbol(&self) -> char {
    match self {
      OpKind::Create => '+',
      OpKind::Update => '~',
      OpKind::Delete => '-',
    }
  }
}

/// One provider operation against one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
  pub name: String,
  pub kind: OpKind,
}

/// Ordered list of operations for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
  pub operations: Vec<Operation>,
}

impl Plan {
  /// Returns true if the plan performs no operations.
  pub fn is_empty(&self) -> bool {
    self.operations.is_empty()
  }

  /// Number of operations.
  pub fn len(&self) -> usize {
    self.operations.len()
  }

  /// Operation scheduled for a logical name, if any.
  pub fn operation_for(&self, name: &str) -> Option<&Operation> {
    self.operations.iter().find(|op| op.name == name)
  }
}

/// Errors building a plan.
#[derive(Debug, Error)]
pub enum PlanError {
  /// A resource is scheduled for both create and delete in one run. Only
  /// reachable from an inconsistent diff; checked defensively.
  #[error("resource '{name}' is scheduled for both create and delete")]
  Conflict { name: String },
}

/// Build the ordered plan for a diff.
///
/// `graph` is the declared-resource graph; `state` supplies the dependency
/// edges between resources being deleted.
pub fn build_plan(
  diff: &StateDiff,
  graph: &ResourceGraph,
  state: &BTreeMap<String, ResourceState>,
) -> Result<Plan, PlanError> {
  let delete_set: HashSet<&String> = diff.to_delete.iter().collect();
  for name in diff.to_create.iter().chain(&diff.to_update) {
    if delete_set.contains(name) {
      return Err(PlanError::Conflict { name: name.clone() });
    }
  }

  let mut operations = Vec::with_capacity(diff.change_count());

  // Dependents are deleted before the resources they depend on.
  let state_graph = ResourceGraph::from_state(state);
  let mut delete_order = state_graph.topological_order();
  delete_order.reverse();
  for name in delete_order {
    if delete_set.contains(&name) {
      operations.push(Operation {
        name,
        kind: OpKind::Delete,
      });
    }
  }

  let create_set: HashSet<&String> = diff.to_create.iter().collect();
  let update_set: HashSet<&String> = diff.to_update.iter().collect();
  for name in graph.topological_order() {
    if create_set.contains(&name) {
      operations.push(Operation {
        name,
        kind: OpKind::Create,
      });
    } else if update_set.contains(&name) {
      operations.push(Operation {
        name,
        kind: OpKind::Update,
      });
    }
  }

  Ok(Plan { operations })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decl::{DeclarationSet, PropValue, ResourceDeclaration};
  use crate::diff::compute_diff;
  use crate::state::ResourceStatus;
  use serde_json::json;

  fn cluster_stack() -> DeclarationSet {
    DeclarationSet::new(vec![
      ResourceDeclaration::new("gcp:compute:Network", "n"),
      ResourceDeclaration::new("gcp:compute:Subnetwork", "s")
        .with_prop("network", PropValue::reference("n", "id")),
      ResourceDeclaration::new("gcp:container:Cluster", "c")
        .with_prop("subnetwork", PropValue::reference("s", "name")),
    ])
  }

  fn settled_state(decls: &DeclarationSet) -> BTreeMap<String, ResourceState> {
    let mut state = BTreeMap::new();
    for (i, decl) in decls.resources.iter().enumerate() {
      let id = format!("sim-{}", i + 1);
      let mut outputs = BTreeMap::new();
      outputs.insert("id".to_string(), json!(id.clone()));
      outputs.insert("name".to_string(), json!(id.clone()));
      state.insert(
        decl.name.clone(),
        ResourceState {
          name: decl.name.clone(),
          kind: decl.kind.clone(),
          props: decl.props.clone(),
          depends_on: decl.depends_on.clone(),
          provider_id: id,
          outputs,
          status: ResourceStatus::Succeeded,
        },
      );
    }
    state
  }

  fn names(plan: &Plan) -> Vec<(&str, OpKind)> {
    plan
      .operations
      .iter()
      .map(|op| (op.name.as_str(), op.kind))
      .collect()
  }

  #[test]
  fn first_run_plans_creates_in_dependency_order() {
    let decls = cluster_stack();
    let graph = ResourceGraph::from_declarations(&decls).unwrap();
    let state = BTreeMap::new();
    let diff = compute_diff(&decls, &state, &graph);

    let plan = build_plan(&diff, &graph, &state).unwrap();
    assert_eq!(
      names(&plan),
      vec![("n", OpKind::Create), ("s", OpKind::Create), ("c", OpKind::Create)]
    );
  }

  #[test]
  fn removing_one_leaf_plans_a_single_delete() {
    let full = cluster_stack();
    let state = settled_state(&full);

    // Same n and s, cluster removed.
    let decls = DeclarationSet::new(full.resources[..2].to_vec());
    let graph = ResourceGraph::from_declarations(&decls).unwrap();

    let diff = compute_diff(&decls, &state, &graph);
    assert_eq!(diff.to_delete, vec!["c"]);
    assert_eq!(diff.unchanged, vec!["n", "s"]);

    let plan = build_plan(&diff, &graph, &state).unwrap();
    assert_eq!(names(&plan), vec![("c", OpKind::Delete)]);
  }

  #[test]
  fn full_teardown_deletes_in_reverse_dependency_order() {
    let full = cluster_stack();
    let state = settled_state(&full);
    let decls = DeclarationSet::empty();
    let graph = ResourceGraph::from_declarations(&decls).unwrap();
    let diff = compute_diff(&decls, &state, &graph);

    let plan = build_plan(&diff, &graph, &state).unwrap();
    assert_eq!(
      names(&plan),
      vec![("c", OpKind::Delete), ("s", OpKind::Delete), ("n", OpKind::Delete)]
    );
  }

  #[test]
  fn deletes_come_before_creates() {
    let full = cluster_stack();
    let state = settled_state(&full);
    let decls = DeclarationSet::new(vec![ResourceDeclaration::new("t", "fresh")]);
    let graph = ResourceGraph::from_declarations(&decls).unwrap();
    let diff = compute_diff(&decls, &state, &graph);

    let plan = build_plan(&diff, &graph, &state).unwrap();
    let delete_positions: Vec<usize> = plan
      .operations
      .iter()
      .enumerate()
      .filter(|(_, op)| op.kind == OpKind::Delete)
      .map(|(i, _)| i)
      .collect();
    let create_pos = plan
      .operations
      .iter()
      .position(|op| op.kind == OpKind::Create)
      .unwrap();
    assert!(delete_positions.iter().all(|&i| i < create_pos));
  }

  #[test]
  fn identical_inputs_yield_identical_plans() {
    let decls = cluster_stack();
    let graph = ResourceGraph::from_declarations(&decls).unwrap();
    let state = BTreeMap::new();
    let diff = compute_diff(&decls, &state, &graph);

    let first = build_plan(&diff, &graph, &state).unwrap();
    let second = build_plan(&diff, &graph, &state).unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn create_delete_conflict_is_rejected() {
    let decls = DeclarationSet::new(vec![ResourceDeclaration::new("t", "x")]);
    let graph = ResourceGraph::from_declarations(&decls).unwrap();
    let diff = StateDiff {
      to_create: vec!["x".to_string()],
      to_delete: vec!["x".to_string()],
      ..StateDiff::default()
    };

    assert!(matches!(
      build_plan(&diff, &graph, &BTreeMap::new()),
      Err(PlanError::Conflict { name }) if name == "x"
    ));
  }
}
