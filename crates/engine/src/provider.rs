//! The provider seam.
//!
//! The engine never talks to a cloud API directly; it drives the
//! [`Provider`] trait, one CRUD call per plan operation. Errors are tagged
//! retryable or fatal so the applier can retry rate limits and similar
//! transient conditions without retrying genuine failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Output attributes returned by a provider operation.
pub type Outputs = BTreeMap<String, Value>;

/// Errors surfaced by a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
  /// Retryable condition, e.g. rate limiting or a timeout.
  #[error("transient provider error: {message}")]
  Transient { message: String },

  /// Non-retryable failure.
  #[error("provider error: {message}")]
  Fatal { message: String },

  /// The provider has no resource with this identifier.
  #[error("resource not found: {id}")]
  NotFound { id: String },
}

impl ProviderError {
  /// Whether the applier may retry the operation.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ProviderError::Transient { .. })
  }
}

/// External system that materializes resources.
#[async_trait]
pub trait Provider: Send + Sync {
  /// Create a resource; returns the provider-assigned id and its outputs.
  async fn create(&self, kind: &str, props: &Outputs) -> Result<(String, Outputs), ProviderError>;

  /// Update an existing resource in place; returns fresh outputs.
  async fn update(&self, provider_id: &str, kind: &str, props: &Outputs)
    -> Result<Outputs, ProviderError>;

  /// Delete an existing resource.
  async fn delete(&self, provider_id: &str) -> Result<(), ProviderError>;

  /// Read a resource's current outputs; `None` if it does not exist.
  async fn read(&self, provider_id: &str) -> Result<Option<Outputs>, ProviderError>;
}

/// Failure script for [`SimProvider`], keyed by resource kind.
#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
  /// Fail the next `times` operations with a retryable error.
  Transient { times: u32 },
  /// Fail every operation with a non-retryable error.
  Fatal,
}

#[derive(Debug, Default)]
struct SimState {
  next_id: u64,
  resources: HashMap<String, SimResource>,
  failures: HashMap<String, FailureMode>,
}

/// A resource held by the simulated provider.
#[derive(Debug, Clone)]
pub struct SimResource {
  pub id: String,
  pub kind: String,
  pub props: Outputs,
}

/// In-memory provider that simulates cloud resources.
///
/// Assigns sequential identifiers and echoes properties back as outputs,
/// plus synthesized `id` and `name` attributes, so declarations can
/// reference each other the way the real stack references network ids and
/// subnetwork names. Failure scripts make retry and partial-failure
/// behavior testable.
#[derive(Debug, Default)]
pub struct SimProvider {
  inner: Mutex<SimState>,
}

impl SimProvider {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script failures for every operation on resources of `kind`.
  pub fn script_failure(&self, kind: &str, mode: FailureMode) {
    let mut inner = self.lock();
    inner.failures.insert(kind.to_string(), mode);
  }

  /// Number of resources currently materialized.
  pub fn resource_count(&self) -> usize {
    self.lock().resources.len()
  }

  /// Snapshot of a materialized resource.
  pub fn resource(&self, provider_id: &str) -> Option<SimResource> {
    self.lock().resources.get(provider_id).cloned()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn check_failure(&self, kind: &str) -> Result<(), ProviderError> {
    let mut inner = self.lock();
    match inner.failures.get(kind).copied() {
      Some(FailureMode::Fatal) => Err(ProviderError::Fatal {
        message: format!("scripted failure for {}", kind),
      }),
      Some(FailureMode::Transient { times }) if times > 0 => {
        inner
          .failures
          .insert(kind.to_string(), FailureMode::Transient { times: times - 1 });
        Err(ProviderError::Transient {
          message: format!("scripted throttle for {}", kind),
        })
      }
      _ => Ok(()),
    }
  }
}

fn synthesize_outputs(id: &str, props: &Outputs) -> Outputs {
  let mut outputs = props.clone();
  outputs.insert("id".to_string(), Value::String(id.to_string()));
  outputs
    .entry("name".to_string())
    .or_insert_with(|| Value::String(id.to_string()));
  outputs
}

#[async_trait]
impl Provider for SimProvider {
  async fn create(&self, kind: &str, props: &Outputs) -> Result<(String, Outputs), ProviderError> {
    self.check_failure(kind)?;

    let mut inner = self.lock();
    inner.next_id += 1;
    let id = format!("sim-{}", inner.next_id);
    inner.resources.insert(
      id.clone(),
      SimResource {
        id: id.clone(),
        kind: kind.to_string(),
        props: props.clone(),
      },
    );
    debug!(kind = %kind, id = %id, "created simulated resource");
    Ok((id.clone(), synthesize_outputs(&id, props)))
  }

  async fn update(
    &self,
    provider_id: &str,
    kind: &str,
    props: &Outputs,
  ) -> Result<Outputs, ProviderError> {
    self.check_failure(kind)?;

    let mut inner = self.lock();
    let Some(resource) = inner.resources.get_mut(provider_id) else {
      return Err(ProviderError::NotFound {
        id: provider_id.to_string(),
      });
    };
    resource.props = props.clone();
    debug!(kind = %kind, id = %provider_id, "updated simulated resource");
    Ok(synthesize_outputs(provider_id, props))
  }

  async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
    let kind = self.lock().resources.get(provider_id).map(|r| r.kind.clone());
    if let Some(kind) = kind {
      self.check_failure(&kind)?;
    }

    let mut inner = self.lock();
    inner.resources.remove(provider_id);
    debug!(id = %provider_id, "deleted simulated resource");
    Ok(())
  }

  async fn read(&self, provider_id: &str) -> Result<Option<Outputs>, ProviderError> {
    let inner = self.lock();
    Ok(
      inner
        .resources
        .get(provider_id)
        .map(|r| synthesize_outputs(&r.id, &r.props)),
    )
  }
}
