//! Diff between declared resources and persisted state.
//!
//! Each logical name is classified as create (declared, no state), update
//! (declared, state differs), delete (state only), or unchanged. Comparison
//! is structural equality over the resolved property map, substituting
//! reference values from persisted producer outputs. Values that are only
//! known after a producer's operation completes never take part in the
//! pre-apply comparison: classification walks the graph in topological
//! order, and a consumer whose producer is itself changing is classified
//! as an update (its fresh inputs propagate at apply time).

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::decl::{DeclarationSet, ResourceDeclaration};
use crate::graph::ResourceGraph;
use crate::resolve::{resolve_props, OutputsByName};
use crate::state::{ResourceState, ResourceStatus};

/// Classification of every logical name in a run. All vectors name-sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
  /// Declared with no prior state.
  pub to_create: Vec<String>,

  /// Declared with diverging prior state.
  pub to_update: Vec<String>,

  /// Prior state with no declaration.
  pub to_delete: Vec<String>,

  /// Declared and matching prior state exactly.
  pub unchanged: Vec<String>,
}

impl StateDiff {
  /// Returns true if nothing needs to change.
  pub fn is_empty(&self) -> bool {
    self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
  }

  /// Number of operations the diff implies.
  pub fn change_count(&self) -> usize {
    self.to_create.len() + self.to_update.len() + self.to_delete.len()
  }
}

/// Compute the diff for a run.
///
/// `graph` must be the graph built from `decls`; `state` is the persisted
/// set from the prior run (possibly empty).
pub fn compute_diff(
  decls: &DeclarationSet,
  state: &BTreeMap<String, ResourceState>,
  graph: &ResourceGraph,
) -> StateDiff {
  let mut diff = StateDiff::default();
  let outputs = succeeded_outputs(state);
  let mut changing: HashSet<String> = HashSet::new();

  for name in graph.topological_order() {
    let Some(decl) = decls.get(&name) else {
      continue;
    };

    let producer_changing = graph
      .dependencies(&name)
      .iter()
      .any(|producer| changing.contains(producer));

    match state.get(&name) {
      None => {
        diff.to_create.push(name.clone());
        changing.insert(name);
      }
      // A prior record without a provider id is an interrupted create.
      Some(prior) if prior.provider_id.is_empty() => {
        diff.to_create.push(name.clone());
        changing.insert(name);
      }
      Some(prior) => {
        if is_unchanged(decl, prior, producer_changing, &outputs) {
          diff.unchanged.push(name);
        } else {
          diff.to_update.push(name.clone());
          changing.insert(name);
        }
      }
    }
  }

  for name in state.keys() {
    if decls.get(name).is_none() {
      diff.to_delete.push(name.clone());
    }
  }

  diff.to_create.sort();
  diff.to_update.sort();
  diff.to_delete.sort();
  diff.unchanged.sort();

  debug!(
    create = diff.to_create.len(),
    update = diff.to_update.len(),
    delete = diff.to_delete.len(),
    unchanged = diff.unchanged.len(),
    "computed diff"
  );

  diff
}

fn is_unchanged(
  decl: &ResourceDeclaration,
  prior: &ResourceState,
  producer_changing: bool,
  outputs: &OutputsByName,
) -> bool {
  if producer_changing {
    return false;
  }
  if prior.status != ResourceStatus::Succeeded {
    return false;
  }
  if decl.kind != prior.kind {
    return false;
  }

  // With every producer unchanged, both sides resolve against the same
  // persisted outputs; failure to resolve means equality cannot be shown.
  match (resolve_props(&decl.props, outputs), resolve_props(&prior.props, outputs)) {
    (Ok(declared), Ok(applied)) => declared == applied,
    _ => false,
  }
}

fn succeeded_outputs(state: &BTreeMap<String, ResourceState>) -> OutputsByName {
  state
    .values()
    .filter(|s| s.status == ResourceStatus::Succeeded)
    .map(|s| (s.name.clone(), s.outputs.clone()))
    .collect()
}
