//! Desired-state resource engine.
//!
//! A declaration set describes the resources that should exist and how
//! they reference each other's outputs. The engine builds the dependency
//! graph, diffs declarations against persisted state, orders the work
//! into a plan, and applies it through a [`Provider`], persisting each
//! resource's state as operations complete.
//!
//! The typical pipeline:
//!
//! ```text
//! DeclarationSet -> ResourceGraph -> StateDiff -> Plan -> apply::run
//! ```

pub mod apply;
pub mod decl;
pub mod diff;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod resolve;
pub mod state;

pub use apply::{run, ApplyError, ApplyOptions, CancelToken, ResourceOutcome, RunReport};
pub use decl::{DeclError, DeclarationSet, PropValue, ResourceDeclaration};
pub use diff::{compute_diff, StateDiff};
pub use graph::{GraphError, ResourceGraph};
pub use plan::{build_plan, OpKind, Operation, Plan, PlanError};
pub use provider::{FailureMode, Outputs, Provider, ProviderError, SimProvider};
pub use resolve::{resolve_props, OutputsByName, ResolveError};
pub use state::{Lease, ResourceState, ResourceStatus, StateError, StateStore};
