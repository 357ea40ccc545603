use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

/// strata - declarative resource graph applier
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Directory holding per-resource state files
  #[arg(long, global = true, default_value = ".strata/state")]
  state_dir: PathBuf,

  /// Maximum number of concurrent provider operations
  #[arg(long, global = true, default_value_t = 4)]
  parallelism: usize,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show what changes would be made (dry-run)
  Preview {
    /// Path to the declaration file (default: strata.json)
    #[arg(default_value = "strata.json")]
    config: PathBuf,
  },

  /// Apply declared resources
  Apply {
    /// Path to the declaration file (default: strata.json)
    #[arg(default_value = "strata.json")]
    config: PathBuf,
  },

  /// Delete every resource tracked in state
  Destroy,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .without_time()
    .init();

  match cli.command {
    Commands::Preview { config } => cmd::cmd_preview(&config, &cli.state_dir, cli.parallelism),
    Commands::Apply { config } => cmd::cmd_apply(&config, &cli.state_dir, cli.parallelism),
    Commands::Destroy => cmd::cmd_destroy(&cli.state_dir, cli.parallelism),
  }
}
