//! Reference resolution.
//!
//! Turns a symbolic property map into concrete values by substituting each
//! output reference with the producer's actual output attribute. The
//! applier calls this right before dispatching an operation, once every
//! producer has completed.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::decl::PropValue;

/// Output attribute maps keyed by logical name.
pub type OutputsByName = BTreeMap<String, BTreeMap<String, Value>>;

/// Errors resolving references.
#[derive(Debug, Error)]
pub enum ResolveError {
  /// The referenced output attribute is not available.
  #[error("output '{attribute}' of resource '{resource}' is not available")]
  UnresolvedOutput { resource: String, attribute: String },
}

/// Resolve a symbolic property map against known outputs.
pub fn resolve_props(
  props: &BTreeMap<String, PropValue>,
  outputs: &OutputsByName,
) -> Result<BTreeMap<String, Value>, ResolveError> {
  props
    .iter()
    .map(|(key, value)| {
      let resolved = match value {
        PropValue::Literal(v) => v.clone(),
        PropValue::Ref { resource, attribute } => outputs
          .get(resource)
          .and_then(|o| o.get(attribute))
          .cloned()
          .ok_or_else(|| ResolveError::UnresolvedOutput {
            resource: resource.clone(),
            attribute: attribute.clone(),
          })?,
      };
      Ok((key.clone(), resolved))
    })
    .collect()
}
