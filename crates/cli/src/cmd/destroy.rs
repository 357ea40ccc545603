//! Implementation of the `strata destroy` command.
//!
//! Runs the applier against an empty declaration set, so every resource
//! tracked in state is planned for deletion in reverse dependency order.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::{style, Term};
use tracing::info;

use strata_engine::{run, ApplyOptions, DeclarationSet, SimProvider, StateStore};

/// Execute the destroy command.
pub fn cmd_destroy(state_dir: &Path, parallelism: usize) -> Result<()> {
  let term = Term::stderr();

  let store = StateStore::new(state_dir);
  let provider = Arc::new(SimProvider::new());
  let options = ApplyOptions {
    parallelism,
    ..ApplyOptions::default()
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(run(&DeclarationSet::empty(), &store, provider, &options))
    .context("Destroy failed")?;

  if report.plan.is_empty() {
    term.write_line(&format!(
      "{} Nothing to destroy",
      style("::").cyan().bold()
    ))?;
    return Ok(());
  }

  super::print_plan(&term, &report.plan)?;
  term.write_line("")?;
  super::print_outcomes(&term, &report)?;

  if !report.is_success() {
    std::process::exit(1);
  }

  info!(state_dir = %store.dir().display(), deleted = report.succeeded(), "destroy complete");
  term.write_line(&format!("{} Done!", style("::").green().bold()))?;
  Ok(())
}
