//! Resource declarations.
//!
//! A declaration describes the desired state of one cloud resource: a
//! provider resource type, a logical name, and a property map. Property
//! values are either literals or references to another declaration's
//! output attribute. References are what the graph builder turns into
//! dependency edges; they are never resolved by string interpolation.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A property value in a resource declaration.
///
/// `Ref` names another declaration's logical name and one of its output
/// attributes. The referenced value is only known once the producer's
/// provider operation has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropValue {
  /// A literal JSON value, known at declaration time.
  Literal(serde_json::Value),
  /// A reference to an output attribute of another declaration.
  Ref { resource: String, attribute: String },
}

impl PropValue {
  /// Shorthand for a literal value.
  pub fn lit(value: impl Into<serde_json::Value>) -> Self {
    PropValue::Literal(value.into())
  }

  /// Shorthand for an output reference.
  pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
    PropValue::Ref {
      resource: resource.into(),
      attribute: attribute.into(),
    }
  }

  /// The logical name this value refers to, if it is a reference.
  pub fn referenced_resource(&self) -> Option<&str> {
    match self {
      PropValue::Literal(_) => None,
      PropValue::Ref { resource, .. } => Some(resource),
    }
  }
}

/// Desired state for a single cloud resource.
///
/// Immutable once declared within a run. The logical name must be unique
/// within a declaration set; the provider resource type (`kind`) and the
/// property values are opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
  /// Provider resource type, e.g. `gcp:compute:Network`.
  pub kind: String,

  /// Logical name, unique within the declaration set.
  pub name: String,

  /// Property map. Keys are provider-defined field names.
  #[serde(default)]
  pub props: BTreeMap<String, PropValue>,

  /// Explicit dependencies in addition to those inferred from references.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,
}

impl ResourceDeclaration {
  /// Create a declaration with no properties.
  pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      name: name.into(),
      props: BTreeMap::new(),
      depends_on: Vec::new(),
    }
  }

  /// Builder-style property insertion.
  pub fn with_prop(mut self, key: impl Into<String>, value: PropValue) -> Self {
    self.props.insert(key.into(), value);
    self
  }

  /// Builder-style explicit dependency.
  pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
    self.depends_on.push(name.into());
    self
  }
}

/// Errors loading a declaration set from disk.
#[derive(Debug, Error)]
pub enum DeclError {
  /// Failed to read the declaration file.
  #[error("failed to read declarations: {0}")]
  Read(#[source] io::Error),

  /// Failed to parse the declaration JSON.
  #[error("failed to parse declarations: {0}")]
  Parse(#[source] serde_json::Error),
}

/// An ordered set of resource declarations for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationSet {
  pub resources: Vec<ResourceDeclaration>,
}

impl DeclarationSet {
  /// Create a declaration set from a list of declarations.
  pub fn new(resources: Vec<ResourceDeclaration>) -> Self {
    Self { resources }
  }

  /// A set with no declarations (used for full teardown).
  pub fn empty() -> Self {
    Self::default()
  }

  /// Load a declaration set from a JSON file.
  pub fn from_file(path: &Path) -> Result<Self, DeclError> {
    let content = fs::read_to_string(path).map_err(DeclError::Read)?;
    serde_json::from_str(&content).map_err(DeclError::Parse)
  }

  /// Look up a declaration by logical name.
  pub fn get(&self, name: &str) -> Option<&ResourceDeclaration> {
    self.resources.iter().find(|r| r.name == name)
  }

  /// Number of declarations in the set.
  pub fn len(&self) -> usize {
    self.resources.len()
  }

  /// Returns true if the set declares nothing.
  pub fn is_empty(&self) -> bool {
    self.resources.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prop_value_serde_roundtrip() {
    let lit = PropValue::lit("10.128.0.0/12");
    let json = serde_json::to_string(&lit).unwrap();
    assert_eq!(json, r#"{"literal":"10.128.0.0/12"}"#);
    assert_eq!(serde_json::from_str::<PropValue>(&json).unwrap(), lit);

    let reference = PropValue::reference("gke-network", "id");
    let json = serde_json::to_string(&reference).unwrap();
    assert_eq!(json, r#"{"ref":{"resource":"gke-network","attribute":"id"}}"#);
    assert_eq!(serde_json::from_str::<PropValue>(&json).unwrap(), reference);
  }

  #[test]
  fn declaration_defaults() {
    let json = r#"{"kind":"gcp:compute:Network","name":"net"}"#;
    let decl: ResourceDeclaration = serde_json::from_str(json).unwrap();
    assert!(decl.props.is_empty());
    assert!(decl.depends_on.is_empty());
  }

  #[test]
  fn from_file_parses_declaration_set() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("decls.json");
    std::fs::write(
      &path,
      r#"{
        "resources": [
          {"kind": "gcp:compute:Network", "name": "net", "props": {"auto_create_subnetworks": {"literal": false}}},
          {"kind": "gcp:compute:Subnetwork", "name": "subnet", "props": {"network": {"ref": {"resource": "net", "attribute": "id"}}}}
        ]
      }"#,
    )
    .unwrap();

    let set = DeclarationSet::from_file(&path).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(
      set.get("subnet").unwrap().props["network"],
      PropValue::reference("net", "id")
    );
  }

  #[test]
  fn from_file_rejects_invalid_json() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("decls.json");
    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(DeclarationSet::from_file(&path), Err(DeclError::Parse(_))));
  }
}
