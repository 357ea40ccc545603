//! Implementation of the `strata preview` command.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::{style, Term};

use strata_engine::{run, ApplyOptions, DeclarationSet, SimProvider, StateStore};

/// Execute the preview command.
///
/// Loads the declaration file, diffs it against persisted state, and
/// prints the plan without performing any operation.
pub fn cmd_preview(config: &Path, state_dir: &Path, parallelism: usize) -> Result<()> {
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
    dry_run: true,
    ..ApplyOptions::default()
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(run(&decls, &store, provider, &options))
    .context("Preview failed")?;

  if report.plan.is_empty() {
    term.write_line(&format!(
      "{} No changes would be made",
      style("::").cyan().bold()
    ))?;
    return Ok(());
  }

  super::print_plan(&term, &report.plan)?;
  term.write_line("")?;
  term.write_line(&format!(
    "{} Would apply {} change(s)",
    style("::").cyan().bold(),
    report.plan.len()
  ))?;

  Ok(())
}
