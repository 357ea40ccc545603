mod apply;
mod destroy;
mod preview;

pub use apply::cmd_apply;
pub use destroy::cmd_destroy;
pub use preview::cmd_preview;

use anyhow::Result;
use console::{style, Term};
use strata_engine::{OpKind, Plan, ResourceOutcome, RunReport};

/// Render the plan, one operation per line.
fn print_plan(term: &Term, plan: &Plan) -> Result<()> {
  for op in &plan.operations {
    let symbol = match op.kind {
      OpKind::Create => style(op.kind.symbol()).green().bold(),
      OpKind::Update => style(op.kind.symbol()).yellow().bold(),
      OpKind::Delete => style(op.kind.symbol()).red().bold(),
    };
    term.write_line(&format!("  {} {}", symbol, op.name))?;
  }
  Ok(())
}

/// Render per-resource outcomes after a run, then the summary counts.
fn print_outcomes(term: &Term, report: &RunReport) -> Result<()> {
  for (name, outcome) in &report.outcomes {
    match outcome {
      ResourceOutcome::Succeeded => {}
      ResourceOutcome::Failed { message } => {
        term.write_line(&format!(
          "  {} {}: {}",
          style("failed").red().bold(),
          name,
          message
        ))?;
      }
      ResourceOutcome::Skipped { failed_dependency } => {
        term.write_line(&format!(
          "  {} {}: dependency {} failed",
          style("skipped").yellow().bold(),
          name,
          failed_dependency
        ))?;
      }
      ResourceOutcome::Cancelled => {
        term.write_line(&format!("  {} {}", style("cancelled").yellow(), name))?;
      }
    }
  }

  let mut summary = format!(
    "{} {} succeeded, {} failed, {} skipped",
    style("::").cyan().bold(),
    report.succeeded(),
    report.failed(),
    report.skipped()
  );
  if report.cancelled() > 0 {
    summary.push_str(&format!(", {} cancelled", report.cancelled()));
  }
  term.write_line(&summary)?;

  Ok(())
}
