//! Persisted resource state.
//!
//! Each applied resource has one JSON file under the state directory.
//! Writes are atomic per resource (write to temp, then rename), so a crash
//! mid-run leaves every previously-succeeded resource's record intact and
//! the run can be resumed by re-diffing.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! ├── .lease            # Held while an applier run is active
//! └── <name>.json       # One ResourceState per logical name
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::decl::PropValue;

/// Lease file name within the state directory.
const LEASE_FILENAME: &str = ".lease";

/// Lifecycle status of a resource, persisted across runs.
///
/// `InProgress` is written before a provider operation is dispatched, so a
/// later run can reconcile interrupted work against the provider instead of
/// blindly retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
  Pending,
  InProgress,
  Succeeded,
  Failed,
  Skipped,
}

/// Persisted record for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
  /// Logical name (also the state file name).
  pub name: String,

  /// Provider resource type at last apply.
  pub kind: String,

  /// Last-applied property map, in symbolic form (references preserved).
  pub props: BTreeMap<String, PropValue>,

  /// Explicit dependencies recorded at apply time, for delete ordering.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,

  /// Provider-assigned identifier. Empty until a create succeeds.
  pub provider_id: String,

  /// Output attributes returned by the provider.
  #[serde(default)]
  pub outputs: BTreeMap<String, serde_json::Value>,

  /// Status the resource reached in the run that wrote this record.
  pub status: ResourceStatus,
}

/// Errors that can occur when working with the state store.
#[derive(Debug, Error)]
pub enum StateError {
  /// Failed to read a state file.
  #[error("failed to read state: {0}")]
  Read(#[source] io::Error),

  /// Failed to write a state file.
  #[error("failed to write state: {0}")]
  Write(#[source] io::Error),

  /// Failed to create the state directory.
  #[error("failed to create state directory: {0}")]
  CreateDir(#[source] io::Error),

  /// Failed to parse a state file.
  #[error("failed to parse state file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  /// Failed to serialize a state record.
  #[error("failed to serialize state: {0}")]
  Serialize(#[source] serde_json::Error),

  /// Failed to remove a state file.
  #[error("failed to remove state: {0}")]
  Remove(#[source] io::Error),

  /// Another run already holds the state lease.
  #[error("state lease already held: {path}")]
  LeaseConflict { path: PathBuf },
}

/// File-backed store of per-resource state.
///
/// At most one applier run may mutate a store at a time; runs serialize via
/// [`StateStore::acquire_lease`].
#[derive(Debug, Clone)]
pub struct StateStore {
  dir: PathBuf,
}

impl StateStore {
  /// Create a store rooted at the given directory.
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  /// The state directory.
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn resource_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{}.json", name))
  }

  fn ensure_dir(&self) -> Result<(), StateError> {
    fs::create_dir_all(&self.dir).map_err(StateError::CreateDir)
  }

  /// Load all persisted resource states, keyed by logical name.
  ///
  /// An absent state directory is an empty state set (first run).
  pub fn load(&self) -> Result<BTreeMap<String, ResourceState>, StateError> {
    let mut states = BTreeMap::new();

    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(states),
      Err(e) => return Err(StateError::Read(e)),
    };

    for entry in entries {
      let entry = entry.map_err(StateError::Read)?;
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      let content = fs::read_to_string(&path).map_err(StateError::Read)?;
      let state: ResourceState =
        serde_json::from_str(&content).map_err(|source| StateError::Parse { path, source })?;
      states.insert(state.name.clone(), state);
    }

    debug!(count = states.len(), dir = %self.dir.display(), "loaded state");
    Ok(states)
  }

  /// Upsert one resource's state record.
  ///
  /// Atomic with respect to that resource: write to temp file, then rename.
  pub fn save(&self, state: &ResourceState) -> Result<(), StateError> {
    self.ensure_dir()?;

    let path = self.resource_path(&state.name);
    let temp_path = self.dir.join(format!("{}.json.tmp", state.name));

    let content = serde_json::to_string_pretty(state).map_err(StateError::Serialize)?;
    fs::write(&temp_path, &content).map_err(StateError::Write)?;
    fs::rename(&temp_path, &path).map_err(StateError::Write)?;

    debug!(resource = %state.name, status = ?state.status, "saved state");
    Ok(())
  }

  /// Remove a resource's state record. Succeeds if it is already gone.
  pub fn remove(&self, name: &str) -> Result<(), StateError> {
    match fs::remove_file(self.resource_path(name)) {
      Ok(()) => {
        debug!(resource = %name, "removed state");
        Ok(())
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(StateError::Remove(e)),
    }
  }

  /// Acquire the run lease for this store.
  ///
  /// Fails with [`StateError::LeaseConflict`] if another run holds it. The
  /// lease must be held for the whole run and released at the end; the
  /// returned guard removes the lease file on drop as a fallback.
  pub fn acquire_lease(&self) -> Result<Lease, StateError> {
    self.ensure_dir()?;
    let path = self.dir.join(LEASE_FILENAME);

    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
      Ok(mut file) => {
        use std::io::Write as _;
        let _ = writeln!(file, "{}", std::process::id());
        info!(path = %path.display(), "acquired state lease");
        Ok(Lease { path, held: true })
      }
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StateError::LeaseConflict { path }),
      Err(e) => Err(StateError::Write(e)),
    }
  }
}

/// Guard for the state store run lease.
pub struct Lease {
  path: PathBuf,
  held: bool,
}

impl Lease {
  /// Release the lease explicitly.
  pub fn release(mut self) -> Result<(), StateError> {
    self.held = false;
    match fs::remove_file(&self.path) {
      Ok(()) => {
        info!(path = %self.path.display(), "released state lease");
        Ok(())
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(StateError::Remove(e)),
    }
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    if self.held {
      let _ = fs::remove_file(&self.path);
    }
  }
}
