//! Implementation of the `strata apply` command.
//!
//! Loads the declaration file, diffs it against persisted state, and
//! applies the resulting plan, persisting per-resource state as
//! operations complete. Exits non-zero if any resource fails.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::{style, Term};
use tracing::info;

use strata_engine::{run, ApplyOptions, DeclarationSet, SimProvider, StateStore};

/// Execute the apply command.
pub fn cmd_apply(config: &Path, state_dir: &Path, parallelism: usize) -> Result<()> {
  let term = Term::stderr();

  if !config.exists() {
    term.write_line(&format!(
      "{} Declaration file not found: {}",
      style("error:").red().bold(),
      config.display()
    ))?;
    std::process::exit(1);
  }

  let decls = match DeclarationSet::from_file(config) {
    Ok(d) => d,
    Err(e) => {
      term.write_line(&format!(
        "{} Failed to load declarations: {}",
        style("error:").red().bold(),
        e
      ))?;
      std::process::exit(1);
    }
  };

  let store = StateStore::new(state_dir);
  let provider = Arc::new(SimProvider::new());
  let options = ApplyOptions {
    parallelism,
    ..ApplyOptions::default()
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(run(&decls, &store, provider, &options))
    .context("Apply failed")?;

  if report.plan.is_empty() {
    term.write_line(&format!(
      "{} No changes to apply",
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

  info!(state_dir = %store.dir().display(), operations = report.plan.len(), "apply complete");
  term.write_line(&format!("{} Done!", style("::").green().bold()))?;
  Ok(())
}
