//! Plan execution.
//!
//! The applier orchestrates a full run: acquire the state lease, load and
//! reconcile persisted state, build the graph, diff, plan, then execute
//! the plan wave by wave. Independent operations within a wave run
//! concurrently, bounded by a semaphore; a dependent is never dispatched
//! until every one of its dependencies has succeeded. A failure marks the
//! failed resource's transitive dependents as skipped while independent
//! branches of the graph proceed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::decl::DeclarationSet;
use crate::diff::{compute_diff, StateDiff};
use crate::graph::{GraphError, ResourceGraph};
use crate::plan::{build_plan, OpKind, Plan, PlanError};
use crate::provider::{Outputs, Provider, ProviderError};
use crate::resolve::{resolve_props, OutputsByName};
use crate::state::{ResourceState, ResourceStatus, StateError, StateStore};

/// Errors that abort a run before or between operations.
///
/// Per-resource operation failures do not abort the run; they are reported
/// in the [`RunReport`].
#[derive(Debug, Error)]
pub enum ApplyError {
  /// Graph construction failed (cycle, unresolved reference, duplicate).
  #[error("graph error: {0}")]
  Graph(#[from] GraphError),

  /// Plan construction failed.
  #[error("plan error: {0}")]
  Plan(#[from] PlanError),

  /// State store access failed (including a held lease).
  #[error("state error: {0}")]
  State(#[from] StateError),
}

/// Run-level cancellation flag.
///
/// Cancelling stops new operations from being dispatched; operations
/// already in flight run to completion and persist their state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation.
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  /// Whether cancellation has been requested.
  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Options for a run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
  /// Maximum number of concurrent provider operations.
  pub parallelism: usize,

  /// Compute the plan but perform no operations.
  pub dry_run: bool,

  /// Attempt budget per operation (first try included).
  pub max_attempts: u32,

  /// Base delay for exponential retry backoff.
  pub retry_base_delay: Duration,

  /// Cancellation flag checked before each dispatch.
  pub cancel: CancelToken,
}

impl Default for ApplyOptions {
  fn default() -> Self {
    Self {
      parallelism: 4,
      dry_run: false,
      max_attempts: 4,
      retry_base_delay: Duration::from_millis(500),
      cancel: CancelToken::new(),
    }
  }
}

/// Terminal outcome of one resource in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceOutcome {
  Succeeded,
  Failed { message: String },
  Skipped { failed_dependency: String },
  Cancelled,
}

/// Final report of a run: the plan that was executed and the terminal
/// outcome of every resource the plan touched.
#[derive(Debug, Default)]
pub struct RunReport {
  pub plan: Plan,
  pub outcomes: BTreeMap<String, ResourceOutcome>,
}

impl RunReport {
  /// Returns true if no resource failed. Skipped resources only occur
  /// downstream of a failure, so success implies none of those either.
  pub fn is_success(&self) -> bool {
    !self
      .outcomes
      .values()
      .any(|o| matches!(o, ResourceOutcome::Failed { .. }))
  }

  /// Count of outcomes matching a predicate.
  fn count(&self, predicate: impl Fn(&ResourceOutcome) -> bool) -> usize {
    self.outcomes.values().filter(|o| predicate(o)).count()
  }

  pub fn succeeded(&self) -> usize {
    self.count(|o| matches!(o, ResourceOutcome::Succeeded))
  }

  pub fn failed(&self) -> usize {
    self.count(|o| matches!(o, ResourceOutcome::Failed { .. }))
  }

  pub fn skipped(&self) -> usize {
    self.count(|o| matches!(o, ResourceOutcome::Skipped { .. }))
  }

  pub fn cancelled(&self) -> usize {
    self.count(|o| matches!(o, ResourceOutcome::Cancelled))
  }
}

/// Execute a full run: reconcile, diff, plan, apply.
///
/// Acquires the state lease for the duration of the run and releases it
/// on the way out, whether the run succeeded or not.
pub async fn run<P>(
  decls: &DeclarationSet,
  store: &StateStore,
  provider: Arc<P>,
  options: &ApplyOptions,
) -> Result<RunReport, ApplyError>
where
  P: Provider + 'static,
{
  let lease = store.acquire_lease()?;
  let result = run_inner(decls, store, provider, options).await;
  if let Err(err) = lease.release() {
    warn!(error = %err, "failed to release state lease");
  }
  result
}

async fn run_inner<P>(
  decls: &DeclarationSet,
  store: &StateStore,
  provider: Arc<P>,
  options: &ApplyOptions,
) -> Result<RunReport, ApplyError>
where
  P: Provider + 'static,
{
  info!(declared = decls.len(), "starting run");

  let mut state = store.load()?;
  reconcile_in_progress(&mut state, store, provider.as_ref()).await?;

  let graph = ResourceGraph::from_declarations(decls)?;
  let diff = compute_diff(decls, &state, &graph);
  let plan = build_plan(&diff, &graph, &state)?;

  info!(
    operations = plan.len(),
    unchanged = diff.unchanged.len(),
    "plan computed"
  );

  if options.dry_run || plan.is_empty() {
    return Ok(RunReport {
      plan,
      outcomes: BTreeMap::new(),
    });
  }

  let mut outcomes = BTreeMap::new();
  let semaphore = Arc::new(Semaphore::new(options.parallelism.max(1)));

  execute_deletes(
    &diff,
    &mut state,
    store,
    &provider,
    options,
    &semaphore,
    &mut outcomes,
  )
  .await;

  execute_forward(
    decls,
    &graph,
    &plan,
    &mut state,
    store,
    &provider,
    options,
    &semaphore,
    &mut outcomes,
  )
  .await;

  let report = RunReport { plan, outcomes };
  info!(
    succeeded = report.succeeded(),
    failed = report.failed(),
    skipped = report.skipped(),
    "run complete"
  );
  Ok(report)
}

/// Reconcile records left `InProgress` by an interrupted run.
///
/// Queries the provider for the actual resource: present means the
/// operation completed (record refreshed as succeeded), absent means it
/// never happened (record dropped so the diff re-creates it). A read
/// failure leaves the record alone; the diff re-applies it.
async fn reconcile_in_progress<P: Provider>(
  state: &mut BTreeMap<String, ResourceState>,
  store: &StateStore,
  provider: &P,
) -> Result<(), ApplyError> {
  let names: Vec<String> = state
    .values()
    .filter(|s| s.status == ResourceStatus::InProgress)
    .map(|s| s.name.clone())
    .collect();

  for name in names {
    let Some(mut record) = state.remove(&name) else {
      continue;
    };

    if record.provider_id.is_empty() {
      debug!(resource = %name, "dropping interrupted create marker");
      store.remove(&name)?;
      continue;
    }

    match provider.read(&record.provider_id).await {
      Ok(Some(outputs)) => {
        info!(resource = %name, "reconciled in-progress resource: present");
        record.outputs = outputs;
        record.status = ResourceStatus::Succeeded;
        store.save(&record)?;
        state.insert(name, record);
      }
      Ok(None) => {
        info!(resource = %name, "reconciled in-progress resource: absent");
        store.remove(&name)?;
      }
      Err(err) => {
        warn!(resource = %name, error = %err, "could not reconcile in-progress resource");
        state.insert(name, record);
      }
    }
  }

  Ok(())
}

/// Delete phase: reverse dependency order over the persisted state graph.
///
/// If deleting a resource fails, the resources it depends on stay in
/// place (skipped), since the provider still considers them referenced.
async fn execute_deletes<P>(
  diff: &StateDiff,
  state: &mut BTreeMap<String, ResourceState>,
  store: &StateStore,
  provider: &Arc<P>,
  options: &ApplyOptions,
  semaphore: &Arc<Semaphore>,
  outcomes: &mut BTreeMap<String, ResourceOutcome>,
) where
  P: Provider + 'static,
{
  if diff.to_delete.is_empty() {
    return;
  }

  let delete_set: HashSet<String> = diff.to_delete.iter().cloned().collect();
  let state_graph = ResourceGraph::from_state(state);
  let mut waves = state_graph.execution_waves();
  waves.reverse();

  let mut failed: HashSet<String> = HashSet::new();

  for wave in waves {
    let mut join: JoinSet<(String, Result<(), String>)> = JoinSet::new();

    for name in wave {
      if !delete_set.contains(&name) {
        continue;
      }
      if options.cancel.is_cancelled() {
        debug!(resource = %name, "delete not dispatched: run cancelled");
        outcomes.insert(name, ResourceOutcome::Cancelled);
        continue;
      }
      // Deletion order inverts the edges: a failed dependent blocks the
      // deletion of what it depends on.
      if let Some(dep) = state_graph.dependents(&name).iter().find(|d| failed.contains(*d)) {
        warn!(resource = %name, blocked_by = %dep, "skipping delete: dependent not deleted");
        outcomes.insert(
          name.clone(),
          ResourceOutcome::Skipped {
            failed_dependency: dep.clone(),
          },
        );
        failed.insert(name);
        continue;
      }
      let Some(prior) = state.get(&name).cloned() else {
        continue;
      };

      let provider = Arc::clone(provider);
      let store = store.clone();
      let opts = options.clone();
      let sem = Arc::clone(semaphore);
      join.spawn(async move {
        let _permit = match sem.acquire_owned().await {
          Ok(permit) => permit,
          Err(_) => return (prior.name.clone(), Err("semaphore closed".to_string())),
        };
        let name = prior.name.clone();
        let result = delete_resource(&prior, provider.as_ref(), &store, &opts).await;
        (name, result)
      });
    }

    while let Some(joined) = join.join_next().await {
      match joined {
        Ok((name, Ok(()))) => {
          info!(resource = %name, "delete succeeded");
          state.remove(&name);
          outcomes.insert(name, ResourceOutcome::Succeeded);
        }
        Ok((name, Err(message))) => {
          error!(resource = %name, error = %message, "delete failed");
          failed.insert(name.clone());
          outcomes.insert(name, ResourceOutcome::Failed { message });
        }
        Err(join_err) => {
          error!(error = %join_err, "delete task panicked");
        }
      }
    }
  }
}

/// Create/update phase: forward dependency order over the declared graph.
#[allow(clippy::too_many_arguments)]
async fn execute_forward<P>(
  decls: &DeclarationSet,
  graph: &ResourceGraph,
  plan: &Plan,
  state: &mut BTreeMap<String, ResourceState>,
  store: &StateStore,
  provider: &Arc<P>,
  options: &ApplyOptions,
  semaphore: &Arc<Semaphore>,
  outcomes: &mut BTreeMap<String, ResourceOutcome>,
) where
  P: Provider + 'static,
{
  let pending: HashMap<String, OpKind> = plan
    .operations
    .iter()
    .filter(|op| op.kind != OpKind::Delete)
    .map(|op| (op.name.clone(), op.kind))
    .collect();
  if pending.is_empty() {
    return;
  }

  // Outputs of resources that are not changing this run are served from
  // persisted state; completed operations overwrite them as they land.
  let mut outputs: OutputsByName = state
    .values()
    .filter(|s| s.status == ResourceStatus::Succeeded)
    .map(|s| (s.name.clone(), s.outputs.clone()))
    .collect();

  let mut failed: HashSet<String> = HashSet::new();

  for wave in graph.execution_waves() {
    let mut join: JoinSet<(String, Result<ResourceState, String>)> = JoinSet::new();

    for name in wave {
      let Some(&kind) = pending.get(&name) else {
        continue;
      };
      if options.cancel.is_cancelled() {
        debug!(resource = %name, "operation not dispatched: run cancelled");
        outcomes.insert(name, ResourceOutcome::Cancelled);
        continue;
      }
      if let Some(dep) = graph.dependencies(&name).iter().find(|d| failed.contains(*d)) {
        warn!(resource = %name, failed_dep = %dep, "skipping resource: dependency failed");
        outcomes.insert(
          name.clone(),
          ResourceOutcome::Skipped {
            failed_dependency: dep.clone(),
          },
        );
        failed.insert(name);
        continue;
      }
      let Some(decl) = decls.get(&name) else {
        continue;
      };

      let resolved = match resolve_props(&decl.props, &outputs) {
        Ok(resolved) => resolved,
        Err(err) => {
          error!(resource = %name, error = %err, "reference resolution failed");
          outcomes.insert(name.clone(), ResourceOutcome::Failed { message: err.to_string() });
          failed.insert(name);
          continue;
        }
      };

      let decl = decl.clone();
      let prior = state.get(&name).cloned();
      let provider = Arc::clone(provider);
      let store = store.clone();
      let opts = options.clone();
      let sem = Arc::clone(semaphore);
      join.spawn(async move {
        let _permit = match sem.acquire_owned().await {
          Ok(permit) => permit,
          Err(_) => return (decl.name.clone(), Err("semaphore closed".to_string())),
        };
        let name = decl.name.clone();
        let result = apply_resource(kind, &decl, &resolved, prior, provider.as_ref(), &store, &opts).await;
        (name, result)
      });
    }

    while let Some(joined) = join.join_next().await {
      match joined {
        Ok((name, Ok(record))) => {
          info!(resource = %name, provider_id = %record.provider_id, "operation succeeded");
          outputs.insert(name.clone(), record.outputs.clone());
          state.insert(name.clone(), record);
          outcomes.insert(name, ResourceOutcome::Succeeded);
        }
        Ok((name, Err(message))) => {
          error!(resource = %name, error = %message, "operation failed");
          failed.insert(name.clone());
          outcomes.insert(name, ResourceOutcome::Failed { message });
        }
        Err(join_err) => {
          error!(error = %join_err, "apply task panicked");
        }
      }
    }
  }
}

/// Create or update one resource, persisting state around the call.
///
/// An `InProgress` marker is written before the provider call; the final
/// record replaces it on success. On failure the prior record is put
/// back, so a clean failure leaves no marker behind.
async fn apply_resource<P: Provider>(
  kind: OpKind,
  decl: &crate::decl::ResourceDeclaration,
  resolved: &Outputs,
  prior: Option<ResourceState>,
  provider: &P,
  store: &StateStore,
  options: &ApplyOptions,
) -> Result<ResourceState, String> {
  let marker = ResourceState {
    name: decl.name.clone(),
    kind: decl.kind.clone(),
    props: decl.props.clone(),
    depends_on: decl.depends_on.clone(),
    provider_id: prior.as_ref().map(|p| p.provider_id.clone()).unwrap_or_default(),
    outputs: prior.as_ref().map(|p| p.outputs.clone()).unwrap_or_default(),
    status: ResourceStatus::InProgress,
  };
  store.save(&marker).map_err(|e| e.to_string())?;

  let call = match kind {
    OpKind::Create => {
      with_retry(|| provider.create(&decl.kind, resolved), &decl.name, options).await
    }
    OpKind::Update => {
      let provider_id = marker.provider_id.clone();
      with_retry(|| provider.update(&provider_id, &decl.kind, resolved), &decl.name, options)
        .await
        .map(|outputs| (provider_id, outputs))
    }
    OpKind::Delete => unreachable!("deletes are executed by delete_resource"),
  };

  match call {
    Ok((provider_id, outputs)) => {
      let record = ResourceState {
        provider_id,
        outputs,
        status: ResourceStatus::Succeeded,
        ..marker
      };
      store.save(&record).map_err(|e| e.to_string())?;
      Ok(record)
    }
    Err(err) => {
      restore_prior(&decl.name, prior, store);
      Err(err.to_string())
    }
  }
}

/// Delete one resource, persisting state around the call.
async fn delete_resource<P: Provider>(
  prior: &ResourceState,
  provider: &P,
  store: &StateStore,
  options: &ApplyOptions,
) -> Result<(), String> {
  let marker = ResourceState {
    status: ResourceStatus::InProgress,
    ..prior.clone()
  };
  store.save(&marker).map_err(|e| e.to_string())?;

  match with_retry(|| provider.delete(&prior.provider_id), &prior.name, options).await {
    Ok(()) => {
      store.remove(&prior.name).map_err(|e| e.to_string())?;
      Ok(())
    }
    Err(err) => {
      restore_prior(&prior.name, Some(prior.clone()), store);
      Err(err.to_string())
    }
  }
}

/// Put the prior record back after a failed operation. Best effort: the
/// operation already failed, and the next run re-diffs from whatever is
/// on disk.
fn restore_prior(name: &str, prior: Option<ResourceState>, store: &StateStore) {
  let result = match prior {
    Some(record) => store.save(&record),
    None => store.remove(name),
  };
  if let Err(err) = result {
    warn!(resource = %name, error = %err, "failed to restore prior state after failure");
  }
}

/// Retry a provider call on transient errors with exponential backoff.
async fn with_retry<T, Fut, F>(
  mut call: F,
  resource: &str,
  options: &ApplyOptions,
) -> Result<T, ProviderError>
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
  let mut attempt: u32 = 0;
  loop {
    match call().await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_retryable() && attempt + 1 < options.max_attempts.max(1) => {
        let delay = options.retry_base_delay * 2u32.saturating_pow(attempt);
        warn!(
          resource = %resource,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          error = %err,
          "transient provider error, retrying"
        );
        sleep(delay).await;
        attempt += 1;
      }
      Err(err) => return Err(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decl::{PropValue, ResourceDeclaration};
  use crate::provider::{FailureMode, SimProvider};
  use serde_json::json;
  use tempfile::TempDir;

  fn fast_options() -> ApplyOptions {
    ApplyOptions {
      retry_base_delay: Duration::from_millis(1),
      ..ApplyOptions::default()
    }
  }

  fn cluster_stack() -> DeclarationSet {
    DeclarationSet::new(vec![
      ResourceDeclaration::new("gcp:compute:Network", "n")
        .with_prop("auto_create_subnetworks", PropValue::lit(false)),
      ResourceDeclaration::new("gcp:compute:Subnetwork", "s")
        .with_prop("ip_cidr_range", PropValue::lit("10.128.0.0/12"))
        .with_prop("network", PropValue::reference("n", "id")),
      ResourceDeclaration::new("gcp:container:Cluster", "c")
        .with_prop("network", PropValue::reference("n", "name"))
        .with_prop("subnetwork", PropValue::reference("s", "name")),
    ])
  }

  #[tokio::test]
  async fn first_run_creates_the_whole_stack() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());
    let decls = cluster_stack();

    let report = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(report.succeeded(), 3);
    assert_eq!(provider.resource_count(), 3);

    // The subnet's network property resolved to the network's provider id.
    let state = store.load().unwrap();
    let network_id = state["n"].provider_id.clone();
    let subnet = provider.resource(&state["s"].provider_id).unwrap();
    assert_eq!(subnet.props["network"], json!(network_id));
  }

  #[tokio::test]
  async fn second_run_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());
    let decls = cluster_stack();

    run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();
    let second = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert!(second.plan.is_empty());
    assert!(second.outcomes.is_empty());
  }

  #[tokio::test]
  async fn create_then_destroy_restores_empty_state() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    run(&cluster_stack(), &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();
    let teardown = run(
      &DeclarationSet::empty(),
      &store,
      Arc::clone(&provider),
      &fast_options(),
    )
    .await
    .unwrap();

    assert!(teardown.is_success());
    assert!(store.load().unwrap().is_empty());
    assert_eq!(provider.resource_count(), 0);
  }

  #[tokio::test]
  async fn removing_a_leaf_deletes_only_that_resource() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let full = cluster_stack();
    run(&full, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    let trimmed = DeclarationSet::new(full.resources[..2].to_vec());
    let report = run(&trimmed, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert_eq!(report.plan.len(), 1);
    assert_eq!(report.plan.operations[0].name, "c");
    assert_eq!(report.plan.operations[0].kind, OpKind::Delete);
    assert_eq!(provider.resource_count(), 2);
  }

  #[tokio::test]
  async fn failed_dependency_skips_dependents_but_not_independents() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());
    provider.script_failure("broken", FailureMode::Fatal);

    let decls = DeclarationSet::new(vec![
      ResourceDeclaration::new("broken", "a"),
      ResourceDeclaration::new("t", "b").with_prop("x", PropValue::reference("a", "id")),
      ResourceDeclaration::new("t", "c"),
    ]);

    let report = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert!(!report.is_success());
    assert!(matches!(report.outcomes["a"], ResourceOutcome::Failed { .. }));
    assert_eq!(
      report.outcomes["b"],
      ResourceOutcome::Skipped {
        failed_dependency: "a".to_string()
      }
    );
    assert_eq!(report.outcomes["c"], ResourceOutcome::Succeeded);

    // The failed resource left no state behind; the next run retries it.
    let state = store.load().unwrap();
    assert!(!state.contains_key("a"));
    assert!(state.contains_key("c"));
  }

  #[tokio::test]
  async fn transient_failures_are_retried_to_success() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());
    provider.script_failure("flaky", FailureMode::Transient { times: 2 });

    let decls = DeclarationSet::new(vec![ResourceDeclaration::new("flaky", "a")]);
    let report = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(report.outcomes["a"], ResourceOutcome::Succeeded);
  }

  #[tokio::test]
  async fn retry_budget_exhaustion_fails_the_resource() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());
    provider.script_failure("flaky", FailureMode::Transient { times: 10 });

    let decls = DeclarationSet::new(vec![ResourceDeclaration::new("flaky", "a")]);
    let options = ApplyOptions {
      max_attempts: 2,
      retry_base_delay: Duration::from_millis(1),
      ..ApplyOptions::default()
    };
    let report = run(&decls, &store, Arc::clone(&provider), &options)
      .await
      .unwrap();

    assert!(matches!(report.outcomes["a"], ResourceOutcome::Failed { .. }));
  }

  #[tokio::test]
  async fn held_lease_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let lease = store.acquire_lease().unwrap();
    let result = run(
      &cluster_stack(),
      &store,
      Arc::clone(&provider),
      &fast_options(),
    )
    .await;

    assert!(matches!(
      result,
      Err(ApplyError::State(StateError::LeaseConflict { .. }))
    ));
    // Aborted before any mutation.
    assert_eq!(provider.resource_count(), 0);
    lease.release().unwrap();
  }

  #[tokio::test]
  async fn cancelled_run_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let options = fast_options();
    options.cancel.cancel();

    let report = run(&cluster_stack(), &store, Arc::clone(&provider), &options)
      .await
      .unwrap();

    assert_eq!(provider.resource_count(), 0);
    assert!(report
      .outcomes
      .values()
      .all(|o| matches!(o, ResourceOutcome::Cancelled)));
    assert_eq!(report.cancelled(), 3);
    assert_eq!(report.succeeded(), 0);
  }

  #[tokio::test]
  async fn dry_run_touches_neither_provider_nor_state() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let options = ApplyOptions {
      dry_run: true,
      ..fast_options()
    };
    let report = run(&cluster_stack(), &store, Arc::clone(&provider), &options)
      .await
      .unwrap();

    assert_eq!(report.plan.len(), 3);
    assert!(report.outcomes.is_empty());
    assert_eq!(provider.resource_count(), 0);
    assert!(store.load().unwrap().is_empty());
  }

  #[tokio::test]
  async fn interrupted_create_marker_is_reconciled_away() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    // Simulate a crash: an InProgress marker with no provider id.
    let decls = DeclarationSet::new(vec![ResourceDeclaration::new("t", "a")]);
    store
      .save(&ResourceState {
        name: "a".to_string(),
        kind: "t".to_string(),
        props: BTreeMap::new(),
        depends_on: Vec::new(),
        provider_id: String::new(),
        outputs: BTreeMap::new(),
        status: ResourceStatus::InProgress,
      })
      .unwrap();

    let report = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    assert!(report.is_success());
    let state = store.load().unwrap();
    assert_eq!(state["a"].status, ResourceStatus::Succeeded);
    assert!(!state["a"].provider_id.is_empty());
  }

  #[tokio::test]
  async fn interrupted_update_marker_is_reconciled_from_provider() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let decls = DeclarationSet::new(vec![
      ResourceDeclaration::new("t", "a").with_prop("x", PropValue::lit(1)),
    ]);
    run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    // Mark the applied record as interrupted; the resource still exists
    // provider-side, so reconciliation refreshes instead of recreating.
    let mut state = store.load().unwrap();
    let mut record = state.remove("a").unwrap();
    record.status = ResourceStatus::InProgress;
    store.save(&record).unwrap();

    let report = run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();
    assert!(report.plan.is_empty());
    assert_eq!(provider.resource_count(), 1);
    assert_eq!(store.load().unwrap()["a"].status, ResourceStatus::Succeeded);
  }

  #[tokio::test]
  async fn failed_delete_blocks_its_dependencies() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path());
    let provider = Arc::new(SimProvider::new());

    let decls = DeclarationSet::new(vec![
      ResourceDeclaration::new("gcp:compute:Network", "n"),
      ResourceDeclaration::new("stuck", "s").with_prop("network", PropValue::reference("n", "id")),
    ]);
    run(&decls, &store, Arc::clone(&provider), &fast_options())
      .await
      .unwrap();

    provider.script_failure("stuck", FailureMode::Fatal);
    let report = run(
      &DeclarationSet::empty(),
      &store,
      Arc::clone(&provider),
      &fast_options(),
    )
    .await
    .unwrap();

    assert!(matches!(report.outcomes["s"], ResourceOutcome::Failed { .. }));
    assert_eq!(
      report.outcomes["n"],
      ResourceOutcome::Skipped {
        failed_dependency: "s".to_string()
      }
    );
    // Both survive for the next run.
    let state = store.load().unwrap();
    assert!(state.contains_key("n"));
    assert!(state.contains_key("s"));
  }
}
